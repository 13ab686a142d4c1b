//! The process-wide shim slot and the fatal-signal path to `finalize`.
//!
//! The preload entry points and the signal handler share one [`Shim`] through
//! a global slot. Handlers are only installed for signals whose disposition is
//! still `SIG_DFL`; a handler or `SIG_IGN` set by the host always wins. On a
//! signal the handler restores `SIG_DFL`, finalizes, and raises the signal
//! again so the process dies exactly as it would have without the shim.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::c_int;

use crate::config::BuildVariant;
use crate::shim::Shim;
use crate::trace;

/// Signals that finalize the run before terminating the process.
pub const SIGNALS: [c_int; 11] = [
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGTERM,
    libc::SIGXCPU,
    libc::SIGUSR1,
];

static SHIM: Mutex<Option<Shim>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<Shim>> {
    SHIM.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Put `shim` in the global slot, replacing any previous one.
pub fn install_global(shim: Shim) {
    *slot() = Some(shim);
}

/// Run `f` on the global shim, if there is one.
pub fn with_global<R>(f: impl FnOnce(&mut Shim) -> R) -> Option<R> {
    slot().as_mut().map(f)
}

/// Constructor entry point: create the global shim for `variant` if needed,
/// set up logging, run `init`, and install signal handlers when admitted.
pub fn init_global<S: AsRef<str>>(variant: BuildVariant, args: &[S]) {
    let mut slot = slot();
    let shim = slot.get_or_insert_with(|| Shim::for_process(variant));
    trace::init_logging(shim.settings().trace);
    let admitted = shim.init(args).is_ok();
    let wanted = shim.settings().signal_handler;
    drop(slot);

    if admitted && wanted {
        let installed = install_handlers();
        log::debug!("  Signal handlers installed for {installed:?}");
    }
}

/// Destructor entry point.
pub fn finalize_global() {
    with_global(Shim::finalize);
}

/// Current disposition of `sig`.
fn disposition(sig: c_int) -> Option<libc::sighandler_t> {
    // SAFETY: `sigaction` with a null new action only reads the current one
    // into `old`, which is a valid, writable struct.
    unsafe {
        let mut old: libc::sigaction = std::mem::zeroed();
        (libc::sigaction(sig, std::ptr::null(), &mut old) == 0).then_some(old.sa_sigaction)
    }
}

/// Whether `sig` still has its default disposition.
pub fn is_default(sig: c_int) -> bool {
    disposition(sig) == Some(libc::SIG_DFL)
}

/// Install the finalizing handler for every signal in [`SIGNALS`] that still
/// has its default disposition. Returns the signals it was installed for.
pub fn install_handlers() -> Vec<c_int> {
    SIGNALS
        .iter()
        .copied()
        .filter(|&sig| is_default(sig) && install(sig))
        .collect()
}

fn install(sig: c_int) -> bool {
    // SAFETY: `action` is fully initialized; `on_signal` is an `extern "C"`
    // function with the signature `sa_handler` expects.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as *const () as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(sig, &action, std::ptr::null_mut()) == 0
    }
}

extern "C" fn on_signal(sig: c_int) {
    // SAFETY: resetting to the default disposition has no preconditions.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
    // The interrupted code may hold the slot; then there is nothing safe to do.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Ok(mut slot) = SHIM.try_lock()
            && let Some(shim) = slot.as_mut()
        {
            shim.finalize();
        }
    }));
    // SAFETY: re-delivers the signal under its default disposition.
    unsafe {
        libc::raise(sig);
    }
}
