//! Process entry points for runtrack.
//!
//! Built as a `cdylib` this is the library named in `LD_PRELOAD`; built as a
//! `staticlib` (with the `static-link` feature) it is linked straight into a
//! program. Either way the loader calls [`runtrack_init`] before `main` through
//! `.init_array` and [`runtrack_fini`] after `main` returns through
//! `.fini_array`. Both hand off to the process-wide shim in `runtrack-core`.

use std::ffi::{CStr, c_char, c_int};
use std::panic;

use runtrack_core::BuildVariant;
use runtrack_core::signals;

/// Build variant this library reports in the build-state marker.
pub const VARIANT: BuildVariant = if cfg!(feature = "static-link") {
    BuildVariant::Static
} else {
    BuildVariant::Preload
};

/// Copy the C argument vector into owned strings.
///
/// # Safety
/// `argv` must be null or point to at least `argc` valid C strings.
unsafe fn collect_args(argc: c_int, argv: *const *const c_char) -> Vec<String> {
    if argv.is_null() {
        return Vec::new();
    }
    let count = usize::try_from(argc).unwrap_or(0);
    (0..count)
        .filter_map(|i| {
            // SAFETY: `i < argc` and the caller guarantees `argv` has `argc` entries.
            let p = unsafe { *argv.add(i) };
            // SAFETY: non-null entries are NUL-terminated strings from the loader.
            (!p.is_null()).then(|| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
        })
        .collect()
}

/// Constructor. glibc passes `argc`, `argv` and `envp` to `.init_array`
/// functions.
pub extern "C" fn runtrack_init(
    argc: c_int,
    argv: *const *const c_char,
    _envp: *const *const c_char,
) {
    // SAFETY: the loader hands us the process's own argument vector.
    let args = unsafe { collect_args(argc, argv) };
    if panic::catch_unwind(|| signals::init_global(VARIANT, &args)).is_err() {
        log::error!("runtrack: initialization panicked; this run is not tracked");
    }
    register_fini();
}

#[cfg(target_os = "linux")]
fn register_fini() {}

/// No `.fini_array` here; run the destructor from `atexit` instead.
#[cfg(not(target_os = "linux"))]
fn register_fini() {
    // SAFETY: registering a plain `extern "C"` callback.
    unsafe {
        libc::atexit(runtrack_fini);
    }
}

/// Destructor.
pub extern "C" fn runtrack_fini() {
    if panic::catch_unwind(signals::finalize_global).is_err() {
        log::error!("runtrack: finalization panicked; no record written");
    }
}

type InitFn = extern "C" fn(c_int, *const *const c_char, *const *const c_char);

#[used]
#[cfg_attr(target_os = "linux", unsafe(link_section = ".init_array"))]
#[cfg_attr(target_os = "macos", unsafe(link_section = "__DATA,__mod_init_func"))]
static INIT: InitFn = runtrack_init;

#[cfg(target_os = "linux")]
#[used]
#[unsafe(link_section = ".fini_array")]
static FINI: extern "C" fn() = runtrack_fini;
