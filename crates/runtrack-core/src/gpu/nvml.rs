//! NVML per-device process accounting, loaded at runtime.

use std::ffi::{CStr, c_char, c_int, c_uint, c_ulonglong, c_void};

use libloading::Library;

use super::{AccountingApi, GpuError, PidStats};

const LIBRARIES: &[&str] = &["libnvidia-ml.so.1", "libnvidia-ml.so"];

type NvmlReturn = c_int;
type NvmlDevice = *mut c_void;

const NVML_SUCCESS: NvmlReturn = 0;
const NVML_FEATURE_ENABLED: c_uint = 1;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct NvmlAccountingStats {
    gpu_utilization: c_uint,
    memory_utilization: c_uint,
    max_memory_usage: c_ulonglong,
    time: c_ulonglong,
    start_time: c_ulonglong,
    is_running: c_uint,
    reserved: [c_uint; 5],
}

type InitFn = unsafe extern "C" fn() -> NvmlReturn;
type ShutdownFn = unsafe extern "C" fn() -> NvmlReturn;
type ErrorStringFn = unsafe extern "C" fn(NvmlReturn) -> *const c_char;
type DeviceGetCountFn = unsafe extern "C" fn(*mut c_uint) -> NvmlReturn;
type DeviceGetHandleByIndexFn = unsafe extern "C" fn(c_uint, *mut NvmlDevice) -> NvmlReturn;
type DeviceGetAccountingModeFn = unsafe extern "C" fn(NvmlDevice, *mut c_uint) -> NvmlReturn;
type DeviceGetAccountingBufferSizeFn = unsafe extern "C" fn(NvmlDevice, *mut c_uint) -> NvmlReturn;
type DeviceGetAccountingPidsFn =
    unsafe extern "C" fn(NvmlDevice, *mut c_uint, *mut c_uint) -> NvmlReturn;
type DeviceGetAccountingStatsFn =
    unsafe extern "C" fn(NvmlDevice, c_uint, *mut NvmlAccountingStats) -> NvmlReturn;

/// An initialized NVML instance. Shut down and unloaded on drop.
pub struct NvmlAccounting {
    shutdown: ShutdownFn,
    error_string: ErrorStringFn,
    device_get_count: DeviceGetCountFn,
    device_get_handle_by_index: DeviceGetHandleByIndexFn,
    device_get_accounting_mode: DeviceGetAccountingModeFn,
    device_get_accounting_buffer_size: DeviceGetAccountingBufferSizeFn,
    device_get_accounting_pids: DeviceGetAccountingPidsFn,
    device_get_accounting_stats: DeviceGetAccountingStatsFn,
    initialized: bool,
    // Declared last so the function pointers above are dropped first.
    _lib: Library,
}

// SAFETY: NVML is documented as thread-safe; the struct holds only function
// pointers into the library it owns.
unsafe impl Send for NvmlAccounting {}

fn load() -> Result<Library, GpuError> {
    let mut last = None;
    for name in LIBRARIES {
        // SAFETY: loading the vendor library runs its initializers, which is
        // the documented way to use NVML.
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

/// Copy a function pointer out of `lib`.
///
/// # Safety
/// `T` must match the C signature of `symbol`.
unsafe fn sym<T: Copy>(lib: &Library, symbol: &'static str) -> Result<T, GpuError> {
    let name = format!("{symbol}\0");
    // SAFETY: guaranteed by the caller.
    unsafe { lib.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|source| GpuError::Symbol { symbol, source })
}

fn call_error(error_string: ErrorStringFn, call: &'static str, code: NvmlReturn) -> GpuError {
    // SAFETY: nvmlErrorString returns a static NUL-terminated string.
    let message = unsafe {
        let p = error_string(code);
        if p.is_null() {
            String::from("unknown error")
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    };
    GpuError::Call {
        call,
        code,
        message,
    }
}

impl NvmlAccounting {
    /// Load the library and call `nvmlInit`.
    pub fn open() -> Result<Self, GpuError> {
        let lib = load()?;
        // SAFETY: each type alias mirrors the signature in nvml.h.
        unsafe {
            let init: InitFn = sym(&lib, "nvmlInit_v2")?;
            let error_string: ErrorStringFn = sym(&lib, "nvmlErrorString")?;
            let mut api = Self {
                shutdown: sym(&lib, "nvmlShutdown")?,
                error_string,
                device_get_count: sym(&lib, "nvmlDeviceGetCount_v2")?,
                device_get_handle_by_index: sym(&lib, "nvmlDeviceGetHandleByIndex_v2")?,
                device_get_accounting_mode: sym(&lib, "nvmlDeviceGetAccountingMode")?,
                device_get_accounting_buffer_size: sym(&lib, "nvmlDeviceGetAccountingBufferSize")?,
                device_get_accounting_pids: sym(&lib, "nvmlDeviceGetAccountingPids")?,
                device_get_accounting_stats: sym(&lib, "nvmlDeviceGetAccountingStats")?,
                initialized: false,
                _lib: lib,
            };
            let rc = init();
            if rc != NVML_SUCCESS {
                return Err(call_error(error_string, "nvmlInit", rc));
            }
            api.initialized = true;
            Ok(api)
        }
    }

    fn check(&self, call: &'static str, rc: NvmlReturn) -> Result<(), GpuError> {
        if rc == NVML_SUCCESS {
            Ok(())
        } else {
            Err(call_error(self.error_string, call, rc))
        }
    }

    fn device(&self, index: u32) -> Result<NvmlDevice, GpuError> {
        let mut device: NvmlDevice = std::ptr::null_mut();
        // SAFETY: `device` is a valid out-pointer.
        let rc = unsafe { (self.device_get_handle_by_index)(index, &mut device) };
        self.check("nvmlDeviceGetHandleByIndex", rc)?;
        Ok(device)
    }
}

impl AccountingApi for NvmlAccounting {
    fn device_count(&self) -> Result<u32, GpuError> {
        let mut count: c_uint = 0;
        // SAFETY: `count` is a valid out-pointer.
        let rc = unsafe { (self.device_get_count)(&mut count) };
        self.check("nvmlDeviceGetCount", rc)?;
        Ok(count)
    }

    fn accounting_enabled(&self, device: u32) -> Result<bool, GpuError> {
        let handle = self.device(device)?;
        let mut mode: c_uint = 0;
        // SAFETY: valid handle from NVML and valid out-pointer.
        let rc = unsafe { (self.device_get_accounting_mode)(handle, &mut mode) };
        self.check("nvmlDeviceGetAccountingMode", rc)?;
        Ok(mode == NVML_FEATURE_ENABLED)
    }

    fn accounting_pids(&self, device: u32) -> Result<Vec<u32>, GpuError> {
        let handle = self.device(device)?;
        let mut capacity: c_uint = 0;
        // SAFETY: valid handle and out-pointer.
        let rc = unsafe { (self.device_get_accounting_buffer_size)(handle, &mut capacity) };
        self.check("nvmlDeviceGetAccountingBufferSize", rc)?;

        let mut pids = vec![0 as c_uint; capacity as usize];
        let mut count = capacity;
        // SAFETY: `pids` has room for `count` entries; NVML writes at most that
        // many and updates `count`.
        let rc =
            unsafe { (self.device_get_accounting_pids)(handle, &mut count, pids.as_mut_ptr()) };
        self.check("nvmlDeviceGetAccountingPids", rc)?;
        pids.truncate(count.min(capacity) as usize);
        Ok(pids)
    }

    fn pid_stats(&self, device: u32, pid: u32) -> Result<PidStats, GpuError> {
        let handle = self.device(device)?;
        let mut stats = NvmlAccountingStats::default();
        // SAFETY: `stats` matches nvmlAccountingStats_t.
        let rc = unsafe { (self.device_get_accounting_stats)(handle, pid, &mut stats) };
        self.check("nvmlDeviceGetAccountingStats", rc)?;
        Ok(PidStats {
            start_time: stats.start_time,
            max_memory_usage: stats.max_memory_usage,
        })
    }
}

impl Drop for NvmlAccounting {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        // SAFETY: NVML was initialized in `open`.
        let rc = unsafe { (self.shutdown)() };
        if let Err(e) = self.check("nvmlShutdown", rc) {
            log::debug!("  Error shutting down NVML: {e}");
        }
    }
}
