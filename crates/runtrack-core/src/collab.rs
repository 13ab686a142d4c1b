//! Collaborators the lifecycle delegates to.
//!
//! Site policy (which hosts and executables to track), provenance detection,
//! and temp-directory cleanup live outside the lifecycle engine. Each one is a
//! trait with a small default implementation so the shim works out of the box;
//! sites replace them through [`Collaborators`].

use std::path::{Path, PathBuf};

use crate::argv::{ArgQuoter, JsonQuoter};
use crate::env::Env;

/// Outcome of a host or path classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Track, and report the run as a packages run.
    Packages,
    /// Track normally.
    Keep,
    /// Do not track.
    Skip,
}

/// Decides whether runs on a given host are tracked.
pub trait HostClassifier: Send {
    fn classify(&self, nodename: &str) -> Classification;
}

/// Decides whether a given executable is tracked.
pub trait PathClassifier: Send {
    fn classify(&self, exec_path: &Path) -> Classification;
}

/// Finds the provenance watermark embedded in the running executable.
pub trait WatermarkProbe: Send {
    /// The watermark text, or `"FALSE"` when none is found.
    fn probe(&self, exec_path: &Path) -> String;
}

/// Removes per-run scratch space left behind by packages runs.
pub trait TmpDirCleaner: Send {
    fn remove_run_tmpdir(&self, run_id: &str);
}

/// Resolves the system-host identifier reported with every record.
pub trait SyshostResolver: Send {
    fn syshost(&self, env: &dyn Env, nodename: &str) -> String;
}

/// Accepts every host.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllHosts;

impl HostClassifier for AcceptAllHosts {
    fn classify(&self, _nodename: &str) -> Classification {
        Classification::Keep
    }
}

/// Skips executables under system directories and marks interpreters as
/// packages runs.
#[derive(Debug, Clone)]
pub struct PrefixPathClassifier {
    pub skip_prefixes: Vec<PathBuf>,
    pub package_names: Vec<String>,
}

impl Default for PrefixPathClassifier {
    fn default() -> Self {
        let skip = [
            "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/usr/lib", "/usr/lib64", "/usr/libexec",
            "/lib", "/lib64", "/etc", "/opt/runtrack",
        ];
        Self {
            skip_prefixes: skip.iter().map(PathBuf::from).collect(),
            package_names: ["python", "python2", "python3", "R", "Rscript", "MATLAB"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PathClassifier for PrefixPathClassifier {
    fn classify(&self, exec_path: &Path) -> Classification {
        let name = exec_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if self.package_names.iter().any(|p| name.starts_with(p.as_str())) {
            return Classification::Packages;
        }
        if self.skip_prefixes.iter().any(|p| exec_path.starts_with(p)) {
            return Classification::Skip;
        }
        Classification::Keep
    }
}

/// Reports no watermark.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatermark;

impl WatermarkProbe for NoWatermark {
    fn probe(&self, _exec_path: &Path) -> String {
        "FALSE".to_string()
    }
}

/// Removes `<tmp>/runtrack_pkgs.<run id>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackagesTmpDir;

impl PackagesTmpDir {
    pub fn path_for(run_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("runtrack_pkgs.{run_id}"))
    }
}

impl TmpDirCleaner for PackagesTmpDir {
    fn remove_run_tmpdir(&self, run_id: &str) {
        if run_id.is_empty() {
            return;
        }
        let dir = Self::path_for(run_id);
        if dir.is_dir()
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            log::debug!("cannot remove {}: {e}", dir.display());
        }
    }
}

/// `RUNTRACK_SYSHOST` if set, else the second dot-separated component of the
/// nodename (`c401-101.stampede2.tacc.utexas.edu` -> `stampede2`), else the
/// nodename itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodenameSyshost;

impl SyshostResolver for NodenameSyshost {
    fn syshost(&self, env: &dyn Env, nodename: &str) -> String {
        if let Some(v) = env.get("RUNTRACK_SYSHOST").filter(|v| !v.is_empty()) {
            return v;
        }
        nodename
            .split('.')
            .nth(1)
            .filter(|s| !s.is_empty())
            .unwrap_or(nodename)
            .to_string()
    }
}

/// The full set of collaborators used by a [`crate::Shim`].
pub struct Collaborators {
    pub hosts: Box<dyn HostClassifier>,
    pub paths: Box<dyn PathClassifier>,
    pub quoter: Box<dyn ArgQuoter>,
    pub watermark: Box<dyn WatermarkProbe>,
    pub tmpdir: Box<dyn TmpDirCleaner>,
    pub syshost: Box<dyn SyshostResolver>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            hosts: Box::new(AcceptAllHosts),
            paths: Box::new(PrefixPathClassifier::default()),
            quoter: Box::new(JsonQuoter),
            watermark: Box::new(NoWatermark),
            tmpdir: Box::new(PackagesTmpDir),
            syshost: Box::new(NodenameSyshost),
        }
    }
}
