//! Build-time defaults and runtime settings.
//!
//! [`Config`] holds what is fixed when the shim is compiled (install location,
//! recorder environment, default sub-toggles). [`Settings`] is read from the
//! environment of each process at init.

use std::path::PathBuf;
use std::time::Duration;

use crate::env::Env;
use crate::gate::KindSet;
use crate::gpu::GpuBackend;
use crate::sampling::SamplingTable;
use crate::trace::TraceMode;

/// Environment variable names.
pub mod vars {
    pub const EXECUTABLE_TRACKING: &str = "RUNTRACK_EXECUTABLE_TRACKING";
    pub const SCALAR_TRACKING: &str = "RUNTRACK_SCALAR_TRACKING";
    pub const MPI_TRACKING: &str = "RUNTRACK_MPI_TRACKING";
    pub const GPU_TRACKING: &str = "RUNTRACK_GPU_TRACKING";
    pub const TRACING: &str = "RUNTRACK_TRACING";
    pub const SIGNAL_HANDLER: &str = "RUNTRACK_SIGNAL_HANDLER";
    pub const SCALAR_SAMPLING: &str = "RUNTRACK_SCALAR_SAMPLING";
    pub const SCALAR_AND_SPSR_SAMPLING: &str = "RUNTRACK_SCALAR_AND_SPSR_SAMPLING";
    pub const SAMPLING_TABLE: &str = "RUNTRACK_SAMPLING_TABLE";
    pub const RECORDER_TIMEOUT: &str = "RUNTRACK_RECORDER_TIMEOUT";

    /// Build-state marker claiming the process for one build variant.
    pub const INITIAL_STATE: &str = "__RUNTRACK_INITIAL_STATE__";
    pub const RUN_UUID: &str = "RUNTRACK_RUN_UUID";
    pub const DATE_TIME: &str = "RUNTRACK_DATE_TIME";
    pub const DIR: &str = "RUNTRACK_DIR";
    pub const RANDOM_NUMBER: &str = "RUNTRACK_RANDOM_NUMBER";

    pub const PATH: &str = "PATH";
    pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
    pub const LD_PRELOAD: &str = "LD_PRELOAD";
}

/// Recorder command-line interface version.
pub const INTERFACE_VERSION: &str = "5";

/// Name of the recorder under `<install dir>/libexec`.
pub const RECORDER_NAME: &str = "runtrack_run_submission";

/// How this copy of the shim entered the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildVariant {
    Preload,
    Static,
}

impl BuildVariant {
    /// Identity token stored in the build-state marker.
    pub fn token(self) -> &'static str {
        match self {
            Self::Preload => "LD_PRELOAD",
            Self::Static => "STATIC",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Preload => 0,
            Self::Static => 1,
        }
    }
}

/// Values fixed at build time.
#[derive(Debug, Clone)]
pub struct Config {
    pub variant: BuildVariant,
    pub install_dir: PathBuf,
    pub recorder: PathBuf,
    pub interface_version: String,
    /// `PATH` the recorder runs with.
    pub system_path: String,
    /// `LD_LIBRARY_PATH` the recorder runs with; empty means unset.
    pub recorder_ld_library_path: String,
    pub scalar_tracking: bool,
    pub mpi_tracking: bool,
    pub gpu_tracking: bool,
    pub gpu_backend: GpuBackend,
}

impl Config {
    /// Build-time defaults for `variant`.
    pub fn for_variant(variant: BuildVariant) -> Self {
        let install_dir =
            PathBuf::from(option_env!("RUNTRACK_INSTALL_DIR").unwrap_or("/opt/runtrack"));
        Self {
            variant,
            recorder: install_dir.join("libexec").join(RECORDER_NAME),
            install_dir,
            interface_version: INTERFACE_VERSION.to_string(),
            system_path: option_env!("RUNTRACK_SYSTEM_PATH")
                .unwrap_or("/usr/bin:/bin")
                .to_string(),
            recorder_ld_library_path: option_env!("RUNTRACK_RECORDER_LD_LIBRARY_PATH")
                .unwrap_or("")
                .to_string(),
            scalar_tracking: is_yes(
                option_env!("RUNTRACK_DEFAULT_SCALAR_TRACKING").unwrap_or("yes"),
            ),
            mpi_tracking: is_yes(option_env!("RUNTRACK_DEFAULT_MPI_TRACKING").unwrap_or("yes")),
            gpu_tracking: is_yes(option_env!("RUNTRACK_DEFAULT_GPU_TRACKING").unwrap_or("no")),
            gpu_backend: GpuBackend::compiled(),
        }
    }

    /// Point the config at a different install directory (and its recorder).
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self.recorder = self.install_dir.join("libexec").join(RECORDER_NAME);
        self
    }
}

fn is_yes(v: &str) -> bool {
    v.eq_ignore_ascii_case("yes")
}

/// Per-process settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tracking: bool,
    pub support: KindSet,
    pub gpu_tracking: bool,
    pub trace: TraceMode,
    pub signal_handler: bool,
    pub scalar_sampling: bool,
    pub sampling_table: SamplingTable,
    pub recorder_timeout: Option<Duration>,
}

impl Settings {
    pub fn read(env: &dyn Env, config: &Config) -> Self {
        let toggle = |key: &str, default: bool| env.get(key).map_or(default, |v| is_yes(&v));
        let support = KindSet {
            scalar: toggle(vars::SCALAR_TRACKING, config.scalar_tracking),
            mpi: toggle(vars::MPI_TRACKING, config.mpi_tracking),
        };
        let scalar_sampling = env
            .get(vars::SCALAR_SAMPLING)
            .or_else(|| env.get(vars::SCALAR_AND_SPSR_SAMPLING))
            .is_some_and(|v| v == "yes");
        let sampling_table = match env.get(vars::SAMPLING_TABLE) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                log::warn!("ignoring {}={raw:?}: {e}", vars::SAMPLING_TABLE);
                SamplingTable::default()
            }),
            None => SamplingTable::default(),
        };
        let recorder_timeout = env
            .get(vars::RECORDER_TIMEOUT)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);

        Self {
            tracking: env.is(vars::EXECUTABLE_TRACKING, "yes"),
            support,
            gpu_tracking: env
                .get(vars::GPU_TRACKING)
                .map_or(config.gpu_tracking, |v| v == "yes"),
            trace: TraceMode::from_env(env),
            signal_handler: !env.is(vars::SIGNAL_HANDLER, "no"),
            scalar_sampling,
            sampling_table,
            recorder_timeout,
        }
    }
}
