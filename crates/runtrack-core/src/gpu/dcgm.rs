//! DCGM job statistics, loaded at runtime.
//!
//! An embedded host engine is started in manual mode and a job tagged with the
//! run id watches every GPU. At exit the job is stopped and each GPU's
//! compute-PID count is read back.
//!
//! The job-info structs mirror `dcgmJobInfo_v3` and `dcgmHealthResponse_v4` from
//! the DCGM 3.x `dcgm_structs.h`. DCGM encodes the expected
//! struct size in the version word, so a library whose layout differs rejects
//! the call with a version mismatch instead of writing past our buffer.

use std::ffi::{CStr, c_char, c_double, c_int, c_longlong, c_uint};
use std::mem::size_of;

use libloading::Library;

use super::{GpuError, JobStatsApi};

const LIBRARIES: &[&str] = &["libdcgm.so.4", "libdcgm.so.3", "libdcgm.so"];

type DcgmReturn = c_int;
type DcgmHandle = usize;
type DcgmGroup = usize;

const DCGM_ST_OK: DcgmReturn = 0;
const DCGM_ST_REQUIRES_ROOT: DcgmReturn = -29;
const DCGM_OPERATION_MODE_MANUAL: c_int = 2;
const DCGM_GROUP_ALL_GPUS: DcgmGroup = 0x7fff_ffff;
const DCGM_MAX_NUM_DEVICES: usize = 32;
const DCGM_MAX_PID_INFO_NUM: usize = 16;
const JOB_ID_LEN: usize = 64;
/// `DCGM_ERR_MSG_LENGTH`.
const DCGM_ERR_MSG_LENGTH: usize = 512;
/// `DCGM_HEALTH_WATCH_MAX_INCIDENTS`, which is `DCGM_GROUP_MAX_ENTITIES_V1`.
const DCGM_HEALTH_WATCH_MAX_INCIDENTS: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct StatFp64 {
    min: c_double,
    max: c_double,
    average: c_double,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct StatI64 {
    min: c_longlong,
    max: c_longlong,
    average: c_longlong,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct StatI32 {
    min: c_int,
    max: c_int,
    average: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ProcessUtil {
    pid: c_uint,
    sm_util: c_double,
    mem_util: c_double,
}

/// `dcgmDiagErrorDetail_t`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct DiagErrorDetail {
    msg: [c_char; DCGM_ERR_MSG_LENGTH],
    code: c_int,
}

/// `dcgmIncidentInfo_t`. The two enums are `int`-sized.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct IncidentInfo {
    system: c_int,
    health: c_int,
    error: DiagErrorDetail,
    entity_group_id: c_int,
    entity_id: c_uint,
}

/// `dcgmHealthResponse_v4`, the `overallHealth` member of `dcgmGpuUsageInfo_t`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct HealthResponse {
    version: c_uint,
    overall_health: c_int,
    incident_count: c_uint,
    incidents: [IncidentInfo; DCGM_HEALTH_WATCH_MAX_INCIDENTS],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpuUsageInfo {
    gpu_id: c_uint,
    start_time: c_longlong,
    end_time: c_longlong,
    energy_consumed: c_longlong,
    power_usage: StatFp64,
    pcie_rx_bandwidth: StatI64,
    pcie_tx_bandwidth: StatI64,
    pcie_replays: c_longlong,
    sm_utilization: StatI32,
    memory_utilization: StatI32,
    ecc_single_bit: c_uint,
    ecc_double_bit: c_uint,
    memory_clock: StatI32,
    sm_clock: StatI32,
    num_xid_critical_errors: c_int,
    xid_critical_errors_ts: [c_longlong; 10],
    num_compute_pids: c_int,
    compute_pid_info: [ProcessUtil; DCGM_MAX_PID_INFO_NUM],
    num_graphics_pids: c_int,
    graphics_pid_info: [ProcessUtil; DCGM_MAX_PID_INFO_NUM],
    max_gpu_memory_used: c_longlong,
    sample_interval_usec: c_longlong,
    sync_boost_time: c_longlong,
    power_violation_time: c_longlong,
    thermal_violation_time: c_longlong,
    reliability_violation_time: c_longlong,
    board_limit_violation_time: c_longlong,
    low_utilization_time: c_longlong,
    overall_health: HealthResponse,
}

#[repr(C)]
#[allow(dead_code)]
struct JobInfo {
    version: c_uint,
    num_gpus: c_int,
    summary: GpuUsageInfo,
    gpus: [GpuUsageInfo; DCGM_MAX_NUM_DEVICES],
}

const JOB_INFO_VERSION: c_uint = size_of::<JobInfo>() as c_uint | (3 << 24);

type InitFn = unsafe extern "C" fn() -> DcgmReturn;
type ShutdownFn = unsafe extern "C" fn() -> DcgmReturn;
type StartEmbeddedFn = unsafe extern "C" fn(c_int, *mut DcgmHandle) -> DcgmReturn;
type StopEmbeddedFn = unsafe extern "C" fn(DcgmHandle) -> DcgmReturn;
type JobFn = unsafe extern "C" fn(DcgmHandle, *const c_char) -> DcgmReturn;
type JobStartStatsFn = unsafe extern "C" fn(DcgmHandle, DcgmGroup, *const c_char) -> DcgmReturn;
type WatchJobFieldsFn =
    unsafe extern "C" fn(DcgmHandle, DcgmGroup, c_longlong, c_double, c_int) -> DcgmReturn;
type UpdateAllFieldsFn = unsafe extern "C" fn(DcgmHandle, c_int) -> DcgmReturn;
type JobGetStatsFn = unsafe extern "C" fn(DcgmHandle, *const c_char, *mut JobInfo) -> DcgmReturn;
type ErrorStringFn = unsafe extern "C" fn(DcgmReturn) -> *const c_char;

struct DcgmFns {
    init: InitFn,
    shutdown: ShutdownFn,
    start_embedded: StartEmbeddedFn,
    stop_embedded: StopEmbeddedFn,
    job_start_stats: JobStartStatsFn,
    watch_job_fields: WatchJobFieldsFn,
    update_all_fields: UpdateAllFieldsFn,
    job_stop_stats: JobFn,
    job_get_stats: JobGetStatsFn,
    job_remove: JobFn,
    error_string: ErrorStringFn,
}

/// A running DCGM job. The embedded engine is stopped and the library shut
/// down on drop.
pub struct DcgmJobStats {
    fns: DcgmFns,
    initialized: bool,
    handle: Option<DcgmHandle>,
    _lib: Library,
}

// SAFETY: the handle is only used from the owning thread at a time; the struct
// holds function pointers into the library it owns.
unsafe impl Send for DcgmJobStats {}

fn load() -> Result<Library, GpuError> {
    let mut last = None;
    for name in LIBRARIES {
        // SAFETY: loading the vendor library runs its initializers.
        match unsafe { Library::new(name) } {
            Ok(lib) => return Ok(lib),
            Err(e) => last = Some(e),
        }
    }
    Err(GpuError::Library {
        candidates: LIBRARIES,
        source: last.unwrap_or(libloading::Error::DlOpenUnknown),
    })
}

/// # Safety
/// `T` must match the C signature of `symbol`.
unsafe fn sym<T: Copy>(lib: &Library, symbol: &'static str) -> Result<T, GpuError> {
    let name = format!("{symbol}\0");
    // SAFETY: guaranteed by the caller.
    unsafe { lib.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|source| GpuError::Symbol { symbol, source })
}

fn job_id_buf(job_id: &str) -> [c_char; JOB_ID_LEN] {
    let mut buf = [0 as c_char; JOB_ID_LEN];
    for (dst, src) in buf.iter_mut().zip(job_id.bytes().take(JOB_ID_LEN - 1)) {
        *dst = src as c_char;
    }
    buf
}

/// Redirects fd 2 to `/dev/null` while alive. DCGM prints engine start-up
/// chatter to stderr that must not reach the host's output.
struct SilencedStderr {
    saved: c_int,
}

impl SilencedStderr {
    fn new() -> Option<Self> {
        // SAFETY: plain descriptor calls; every descriptor opened here is
        // closed or handed back in `drop`.
        unsafe {
            let saved = libc::dup(libc::STDERR_FILENO);
            if saved < 0 {
                return None;
            }
            let null = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
            if null < 0 {
                libc::close(saved);
                return None;
            }
            libc::dup2(null, libc::STDERR_FILENO);
            libc::close(null);
            Some(Self { saved })
        }
    }
}

impl Drop for SilencedStderr {
    fn drop(&mut self) {
        // SAFETY: `saved` is the descriptor duplicated in `new`.
        unsafe {
            libc::dup2(self.saved, libc::STDERR_FILENO);
            libc::close(self.saved);
        }
    }
}

impl DcgmJobStats {
    /// Start an embedded engine and a job named `job_id` on all GPUs.
    pub fn start(job_id: &str) -> Result<Self, GpuError> {
        let lib = load()?;
        // SAFETY: each type alias mirrors the signature in dcgm_agent.h.
        let fns = unsafe {
            DcgmFns {
                init: sym(&lib, "dcgmInit")?,
                shutdown: sym(&lib, "dcgmShutdown")?,
                start_embedded: sym(&lib, "dcgmStartEmbedded")?,
                stop_embedded: sym(&lib, "dcgmStopEmbedded")?,
                job_start_stats: sym(&lib, "dcgmJobStartStats")?,
                watch_job_fields: sym(&lib, "dcgmWatchJobFields")?,
                update_all_fields: sym(&lib, "dcgmUpdateAllFields")?,
                job_stop_stats: sym(&lib, "dcgmJobStopStats")?,
                job_get_stats: sym(&lib, "dcgmJobGetStats")?,
                job_remove: sym(&lib, "dcgmJobRemove")?,
                error_string: sym(&lib, "errorString")?,
            }
        };
        let mut stats = Self {
            fns,
            initialized: false,
            handle: None,
            _lib: lib,
        };

        // SAFETY: resolved above with the documented signature.
        stats.check("dcgmInit", unsafe { (stats.fns.init)() })?;
        stats.initialized = true;

        let mut handle: DcgmHandle = 0;
        let rc = {
            let _quiet = SilencedStderr::new();
            // SAFETY: `handle` is a valid out-pointer.
            unsafe { (stats.fns.start_embedded)(DCGM_OPERATION_MODE_MANUAL, &mut handle) }
        };
        stats.check("dcgmStartEmbedded", rc)?;
        stats.handle = Some(handle);

        let id = job_id_buf(job_id);
        // SAFETY: `handle` came from DCGM; `id` is NUL-terminated.
        let rc = unsafe { (stats.fns.job_start_stats)(handle, DCGM_GROUP_ALL_GPUS, id.as_ptr()) };
        stats.check("dcgmJobStartStats", rc)?;

        // SAFETY: as above.
        let rc = unsafe { (stats.fns.watch_job_fields)(handle, DCGM_GROUP_ALL_GPUS, 1000, 1e9, 0) };
        if rc == DCGM_ST_REQUIRES_ROOT {
            log::debug!("    -> May need to enable accounting mode: sudo nvidia-smi -am 1");
        }
        stats.check("dcgmWatchJobFields", rc)?;

        // SAFETY: as above.
        let rc = unsafe { (stats.fns.update_all_fields)(handle, 1) };
        stats.check("dcgmUpdateAllFields", rc)?;
        Ok(stats)
    }

    fn check(&self, call: &'static str, rc: DcgmReturn) -> Result<(), GpuError> {
        if rc == DCGM_ST_OK {
            return Ok(());
        }
        // SAFETY: errorString returns a static NUL-terminated string or null.
        let message = unsafe {
            let p = (self.fns.error_string)(rc);
            if p.is_null() {
                String::from("unknown error")
            } else {
                CStr::from_ptr(p).to_string_lossy().into_owned()
            }
        };
        Err(GpuError::Call {
            call,
            code: rc,
            message,
        })
    }
}

impl JobStatsApi for DcgmJobStats {
    fn finish(&mut self, job_id: &str) -> Result<Vec<u32>, GpuError> {
        let Some(handle) = self.handle else {
            return Ok(Vec::new());
        };
        let id = job_id_buf(job_id);
        // SAFETY: handle from DCGM, NUL-terminated id. Failures here surface
        // through dcgmJobGetStats below.
        unsafe {
            (self.fns.update_all_fields)(handle, 1);
            (self.fns.job_stop_stats)(handle, id.as_ptr());
        }

        // SAFETY: all-zero is a valid bit pattern for these plain C structs.
        let mut info: Box<JobInfo> = unsafe { Box::new_zeroed().assume_init() };
        info.version = JOB_INFO_VERSION;
        // SAFETY: `info` is a properly versioned, writable dcgmJobInfo_t.
        let rc = unsafe { (self.fns.job_get_stats)(handle, id.as_ptr(), info.as_mut()) };
        let result = self.check("dcgmJobGetStats", rc).map(|()| {
            let n = usize::try_from(info.num_gpus).unwrap_or(0).min(DCGM_MAX_NUM_DEVICES);
            log::debug!("  {n} GPUs detected");
            info.gpus[..n]
                .iter()
                .enumerate()
                .map(|(i, gpu)| {
                    log::debug!("  GPU {i}: num compute pids {}", gpu.num_compute_pids);
                    u32::try_from(gpu.num_compute_pids).unwrap_or(0)
                })
                .collect()
        });

        // SAFETY: as above.
        unsafe { (self.fns.job_remove)(handle, id.as_ptr()) };
        result
    }
}

impl Drop for DcgmJobStats {
    fn drop(&mut self) {
        // SAFETY: handle and initialization state tracked since `start`.
        unsafe {
            if let Some(handle) = self.handle.take() {
                (self.fns.stop_embedded)(handle);
            }
            if self.initialized {
                (self.fns.shutdown)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_truncated_and_terminated() {
        let buf = job_id_buf(&"x".repeat(100));
        assert_eq!(buf[JOB_ID_LEN - 1], 0);
        assert_eq!(buf[0], b'x' as c_char);
        let buf = job_id_buf("abc");
        assert_eq!(&buf[..4], &[b'a' as c_char, b'b' as c_char, b'c' as c_char, 0]);
    }

    #[test]
    fn health_response_matches_header_layout() {
        assert_eq!(size_of::<DiagErrorDetail>(), DCGM_ERR_MSG_LENGTH + 4);
        assert_eq!(size_of::<IncidentInfo>(), 4 + 4 + 516 + 8);
        assert_eq!(size_of::<HealthResponse>(), 12 + DCGM_HEALTH_WATCH_MAX_INCIDENTS * 532);
        // `overallHealth` follows eight `long long` violation/time counters.
        assert_eq!(std::mem::offset_of!(GpuUsageInfo, overall_health) % 8, 0);
    }

    #[test]
    fn version_word_encodes_size_and_revision() {
        assert_eq!(JOB_INFO_VERSION >> 24, 3);
        assert_eq!((JOB_INFO_VERSION & 0x00ff_ffff) as usize, size_of::<JobInfo>());
    }

    #[test]
    fn start_without_library_is_an_error() {
        if LIBRARIES.iter().any(|l| std::path::Path::new(&format!("/usr/lib64/{l}")).exists()) {
            return;
        }
        assert!(DcgmJobStats::start("test-job").is_err());
    }

    #[test]
    fn stderr_is_restored_after_silencing() {
        let before = unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_GETFD) };
        drop(SilencedStderr::new());
        let after = unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_GETFD) };
        assert_eq!(before >= 0, after >= 0);
    }
}
