//! Per-process run identity.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::argv::ArgvJson;
use crate::reject::RejectReason;

/// How the instrumented execution is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunKind {
    Scalar,
    Mpi,
    Packages,
}

impl RunKind {
    /// Value passed to the recorder's `--kind` flag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Mpi => "MPI",
            Self::Packages => "PKGS",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about this process's run, from gate success to exit.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub pid: u32,
    pub ppid: u32,
    pub run_id: String,
    pub rank: i64,
    pub size: i64,
    /// Reported kind (may be `Packages`).
    pub kind: RunKind,
    /// Kind implied by scale alone; drives start records and sampling.
    pub scale_kind: RunKind,
    pub exec_path: PathBuf,
    /// `exec_path` escaped for display inside double quotes.
    pub exec_quoted: String,
    pub argv: ArgvJson,
    pub syshost: String,
    pub start_time: f64,
    pub end_time: f64,
    pub probability: f64,
    pub draw: f64,
    pub gpu_count: u32,
    pub watermark: String,
    pub watermark_encoded: String,
    /// Caller's `PATH`, forwarded to the recorder.
    pub path_var: Option<String>,
    /// Caller's `LD_LIBRARY_PATH`, forwarded to the recorder.
    pub ld_library_path_var: Option<String>,
    pub reject: Option<RejectReason>,
}

impl RunContext {
    pub fn runtime(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Seconds since the Unix epoch with microsecond resolution.
pub fn epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Microseconds since the Unix epoch.
pub fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Absolute path of the running executable.
///
/// Uses `/proc/self/exe` where available, otherwise resolves `argv0` against
/// the current directory.
pub fn exec_path(argv0: Option<&str>) -> PathBuf {
    if let Ok(p) = std::fs::read_link("/proc/self/exe") {
        return p;
    }
    let Some(argv0) = argv0 else {
        return PathBuf::new();
    };
    let p = PathBuf::from(argv0);
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&p))
        .unwrap_or(p)
}
