//! GPU usage attributable to this run.
//!
//! Exactly one vendor backend is compiled in, chosen by cargo feature:
//!
//! - `nvml`: per-device process accounting. At exit every accounting PID on
//!   every device is inspected; a device counts when at least one PID started
//!   inside this run's window and used memory.
//! - `dcgm`: a DCGM job-stats session tagged with the run id is started at
//!   init and collected at exit; a device counts when it ran compute PIDs.
//!
//! Vendor libraries are loaded at runtime with `libloading`, so a node without
//! GPUs (or without the library) simply reports zero. Nothing in here is ever
//! fatal to the host.

pub mod dcgm;
pub mod nvml;

use thiserror::Error;

#[cfg(all(feature = "nvml", feature = "dcgm"))]
compile_error!("features `nvml` and `dcgm` are mutually exclusive; enable at most one GPU backend");

/// Error from a vendor GPU library.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("cannot load any of {candidates:?}: {source}")]
    Library {
        candidates: &'static [&'static str],
        #[source]
        source: libloading::Error,
    },
    #[error("missing symbol {symbol}: {source}")]
    Symbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
    #[error("{call} failed: {message} ({code})")]
    Call {
        call: &'static str,
        code: i32,
        message: String,
    },
}

/// Which backend this build uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBackend {
    None,
    Nvml,
    Dcgm,
}

impl GpuBackend {
    /// The backend selected by cargo features.
    pub const fn compiled() -> Self {
        if cfg!(feature = "nvml") {
            Self::Nvml
        } else if cfg!(feature = "dcgm") {
            Self::Dcgm
        } else {
            Self::None
        }
    }
}

/// Accounting record of one GPU process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidStats {
    /// Microseconds since the Unix epoch.
    pub start_time: u64,
    /// Bytes.
    pub max_memory_usage: u64,
}

/// Per-device process accounting (backend A).
pub trait AccountingApi: Send {
    fn device_count(&self) -> Result<u32, GpuError>;
    fn accounting_enabled(&self, device: u32) -> Result<bool, GpuError>;
    fn accounting_pids(&self, device: u32) -> Result<Vec<u32>, GpuError>;
    fn pid_stats(&self, device: u32, pid: u32) -> Result<PidStats, GpuError>;
}

/// Job-scoped statistics (backend B). The job is started when the value is
/// created.
pub trait JobStatsApi: Send {
    /// Stop the job and return the compute-PID count of every device.
    fn finish(&mut self, job_id: &str) -> Result<Vec<u32>, GpuError>;
}

/// A PID belongs to this run if it started inside the window and used memory.
///
/// Every device also lists a constant zero-memory process (believed to be a
/// CUDA cleanup helper) that must not be counted.
pub fn pid_belongs_to_run(stats: &PidStats, window_start: u64) -> bool {
    stats.start_time >= window_start && stats.max_memory_usage > 0
}

/// Devices with at least one PID belonging to this run.
pub fn count_accounting_devices(api: &dyn AccountingApi, window_start: u64) -> u32 {
    let count = match api.device_count() {
        Ok(n) => n,
        Err(e) => {
            log::debug!("  GPU device count unavailable: {e}");
            return 0;
        }
    };
    log::debug!("  {count} GPUs detected");

    let mut used = 0;
    for device in 0..count {
        match api.accounting_enabled(device) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!(
                    "  Accounting mode is not enabled for GPU {device}. \
                     Enable accounting mode: sudo nvidia-smi -i {device} -am 1"
                );
                continue;
            }
            Err(e) => {
                log::debug!("  Unable to get accounting mode for GPU {device}: {e}");
                continue;
            }
        }
        let pids = match api.accounting_pids(device) {
            Ok(pids) => pids,
            Err(e) => {
                log::debug!("  Unable to get accounting data for GPU {device}: {e}");
                continue;
            }
        };
        let active = pids
            .iter()
            .filter(|&&pid| match api.pid_stats(device, pid) {
                Ok(stats) => {
                    let mine = pid_belongs_to_run(&stats, window_start);
                    if mine {
                        log::debug!(
                            "  PID {pid} startTime={} window={window_start}",
                            stats.start_time
                        );
                    }
                    mine
                }
                Err(_) => false,
            })
            .count();
        log::debug!("  GPU {device}: num compute pids {active}");
        if active > 0 {
            used += 1;
        }
    }
    used
}

/// Devices that ran at least one compute PID during the job.
pub fn count_job_devices(compute_pids: &[u32]) -> u32 {
    let used = compute_pids.iter().filter(|&&n| n > 0).count() as u32;
    log::debug!("  {used} of {} GPUs were used", compute_pids.len());
    used
}

/// GPU accounting for one run, from init to exit.
pub enum GpuSession {
    Disabled,
    Accounting {
        api: Box<dyn AccountingApi>,
        window_start: u64,
    },
    JobStats {
        api: Box<dyn JobStatsApi>,
        job_id: String,
        window_start: u64,
    },
}

impl GpuSession {
    /// Best-effort open of the compiled backend. Any failure disables GPU
    /// accounting for this run.
    pub fn open(backend: GpuBackend, enabled: bool, run_id: &str) -> Self {
        if !enabled {
            return Self::Disabled;
        }
        log::debug!("  GPU tracing");
        let window_start = crate::run::epoch_micros();
        let opened = match backend {
            GpuBackend::None => return Self::Disabled,
            GpuBackend::Nvml => nvml::NvmlAccounting::open()
                .map(|api| Self::with_accounting(Box::new(api), window_start)),
            GpuBackend::Dcgm => dcgm::DcgmJobStats::start(run_id)
                .map(|api| Self::with_job_stats(Box::new(api), run_id, window_start)),
        };
        opened.unwrap_or_else(|e| {
            log::debug!("    -> Stopping GPU Tracking => {e}");
            Self::Disabled
        })
    }

    pub fn with_accounting(api: Box<dyn AccountingApi>, window_start: u64) -> Self {
        Self::Accounting { api, window_start }
    }

    pub fn with_job_stats(api: Box<dyn JobStatsApi>, job_id: &str, window_start: u64) -> Self {
        Self::JobStats {
            api,
            job_id: job_id.to_string(),
            window_start,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Window start in microseconds, if a session is open.
    pub fn window_start(&self) -> Option<u64> {
        match self {
            Self::Disabled => None,
            Self::Accounting { window_start, .. } | Self::JobStats { window_start, .. } => {
                Some(*window_start)
            }
        }
    }

    /// Number of GPUs this run used; releases the backend.
    pub fn close(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::Accounting { api, window_start } => {
                count_accounting_devices(api.as_ref(), window_start)
            }
            Self::JobStats {
                mut api, job_id, ..
            } => match api.finish(&job_id) {
                Ok(counts) => count_job_devices(&counts),
                Err(e) => {
                    log::debug!("  GPU job stats unavailable: {e}");
                    0
                }
            },
        }
    }
}
