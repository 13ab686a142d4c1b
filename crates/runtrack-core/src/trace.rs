//! Tracing output and system identity.
//!
//! `RUNTRACK_TRACING=yes` logs every gate decision, `run` logs only the
//! recorder command lines. Output goes through `log`/`env_logger`. When tracing
//! is on, stderr is duplicated at init so messages written at exit still reach
//! the terminal after the host program closes its own stderr.

use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::fd::{FromRawFd, RawFd};
use std::sync::OnceLock;

use log::LevelFilter;

use crate::env::Env;

/// Tracing mode requested through `RUNTRACK_TRACING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    /// Errors only.
    #[default]
    Off,
    /// Recorder command lines.
    Run,
    /// Every gate test and GPU step.
    Verbose,
}

impl TraceMode {
    pub fn from_env(env: &dyn Env) -> Self {
        match env.get(crate::config::vars::TRACING).as_deref() {
            Some("yes") => Self::Verbose,
            Some("run") => Self::Run,
            _ => Self::Off,
        }
    }

    pub fn level(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Error,
            Self::Run => LevelFilter::Info,
            Self::Verbose => LevelFilter::Debug,
        }
    }

    pub fn is_on(self) -> bool {
        self != Self::Off
    }
}

static LOGGER_MODE: OnceLock<TraceMode> = OnceLock::new();

/// Install the process logger for `mode`. Only the first call has an effect;
/// returns the mode actually in use.
pub fn init_logging(mode: TraceMode) -> TraceMode {
    *LOGGER_MODE.get_or_init(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(mode.level())
            .format_timestamp(None)
            .format_target(false);
        match mode.is_on().then(duplicate_stderr).flatten() {
            Some(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            None => {
                builder.target(env_logger::Target::Stderr);
            }
        }
        // A logger installed by someone else in this image keeps precedence.
        let _ = builder.try_init();
        mode
    })
}

#[cfg(unix)]
fn duplicate_stderr() -> Option<File> {
    // SAFETY: `dup` has no memory-safety preconditions.
    let fd: RawFd = unsafe { libc::dup(libc::STDERR_FILENO) };
    if fd < 0 {
        return None;
    }
    // SAFETY: `fd` is a freshly duplicated descriptor owned by nobody else.
    Some(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn duplicate_stderr() -> Option<File> {
    None
}

/// Result of `uname(2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub nodename: String,
    pub sysname: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

impl SystemIdentity {
    pub fn detect() -> io::Result<Self> {
        // SAFETY: `utsname` is plain old data; all-zero is a valid value.
        let mut u: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: `u` is a valid, writable `utsname`.
        if unsafe { libc::uname(&mut u) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            nodename: field(&u.nodename),
            sysname: field(&u.sysname),
            release: field(&u.release),
            version: field(&u.version),
            machine: field(&u.machine),
        })
    }
}

fn field(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Log the identification banner shown once per process tree.
pub fn log_banner(id: &SystemIdentity, syshost: &str) {
    let date = chrono::Local::now().format("%c");
    log::debug!(
        "---------------------------------------------\n \
         Date:          {date}\n \
         runtrack:      {}\n \
         Nodename:      {}\n \
         System:        {}\n \
         Release:       {}\n \
         O.S. Version:  {}\n \
         Machine:       {}\n \
         Syshost:       {syshost}\n\
         ---------------------------------------------\n",
        crate::VERSION,
        id.nodename,
        id.sysname,
        id.release,
        id.version,
        id.machine,
    );
}
