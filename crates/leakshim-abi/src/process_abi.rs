//! Process exit interceptors and guarded forwarders.
//!
//! The leak check runs from an at-exit handler registered during initialization.
//! The status the program asked for is recorded by `exit` (and by returning from
//! `main`, which is wrapped through `__libc_start_main`) so the handler can tell
//! whether a successful exit must be turned into the leak exit code.

use std::ffi::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use leakshim_core::diag;
use leakshim_core::engine::LeakEngine;
use leakshim_core::error::ShimError;
use leakshim_core::exit::{ExitStatus, resolve_exit_status};
use leakshim_core::reentrancy::ReentrancyGuard;

use crate::interpose::{self, AtexitCallback, ForkHook, HookFn, MainFn};
use crate::runtime_state;

static EXIT_STATUS: ExitStatus = ExitStatus::new();
static REAL_MAIN: AtomicUsize = AtomicUsize::new(0);

/// Terminate through the real `_exit`, bypassing every handler.
fn real_exit_now(status: c_int) -> ! {
    if let Some(real) = interpose::real__exit() {
        // SAFETY: `_exit` never returns.
        unsafe { real(status) }
    }
    // SAFETY: raw exit_group; no userspace state is touched.
    unsafe { libc::syscall(libc::SYS_exit_group, status as libc::c_long) };
    std::process::abort()
}

/// Run the engine's leak check and resolve the exit status.
///
/// Returns the status to terminate with when it must override the one the
/// program requested, `None` otherwise. Only the first call resolves.
pub fn run_exit_leak_check() -> Option<c_int> {
    let engine = runtime_state::engine();
    engine.do_leak_check();
    EXIT_STATUS.leak_override(engine)
}

unsafe extern "C" fn leak_check_at_exit(_arg: *mut c_void) {
    if let Some(status) = run_exit_leak_check() {
        // SAFETY: flushing all stdio streams has no preconditions.
        unsafe { libc::fflush(std::ptr::null_mut()) };
        real_exit_now(status);
    }
}

/// Register the at-exit leak check with the real `__cxa_atexit`.
pub(crate) fn register_leak_check_at_exit() -> Result<(), ShimError> {
    let real = interpose::real___cxa_atexit()
        .ok_or(ShimError::SymbolUnresolved("__cxa_atexit"))?;
    let _guard = ReentrancyGuard::enter();
    // SAFETY: the callback is a plain function with the `__cxa_atexit` signature.
    let rc = unsafe { real(Some(leak_check_at_exit), std::ptr::null_mut(), std::ptr::null_mut()) };
    if rc != 0 {
        leakshim_core::diag_report!("WARNING: leakshim: cannot register at-exit leak check (rc {rc})");
    }
    Ok(())
}

/// Status recorded by `exit` or the wrapped `main`, if any.
#[must_use]
pub fn recorded_exit_status() -> Option<c_int> {
    EXIT_STATUS.requested()
}

/// `_exit`: a successful status becomes the leak exit code once leaks have been
/// reported. Any other status is passed through.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn _exit(status: c_int) -> ! {
    let engine = runtime_state::engine();
    let status = resolve_exit_status(
        status,
        engine.has_reported_leaks(),
        engine.configured_leak_exit_code(),
    );
    real_exit_now(status)
}

/// `exit`: record the requested status, then run the normal exit sequence.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn exit(status: c_int) -> ! {
    EXIT_STATUS.record(status);
    let Some(real) = interpose::real_exit() else {
        diag::die(&ShimError::SymbolUnresolved("exit"));
    };
    // SAFETY: `exit` never returns.
    unsafe { real(status) }
}

unsafe extern "C" fn wrapped_main(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let raw = REAL_MAIN.load(Ordering::Acquire);
    // SAFETY: only `__libc_start_main` stores here, always a `MainFn`.
    let main = unsafe { std::mem::transmute::<usize, MainFn>(raw) };
    // SAFETY: the program's own main with the loader's arguments.
    let status = unsafe { main(argc, argv, envp) };
    // SAFETY: returning from main is exit(status).
    unsafe { exit(status) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __libc_start_main(
    main: Option<MainFn>,
    argc: c_int,
    ubp_av: *mut *mut c_char,
    init: Option<HookFn>,
    fini: Option<HookFn>,
    rtld_fini: Option<HookFn>,
    stack_end: *mut c_void,
) -> c_int {
    runtime_state::ensure_initialized();
    let Some(real) = interpose::real___libc_start_main() else {
        diag::die(&ShimError::SymbolUnresolved("__libc_start_main"));
    };
    let main = main.map(|m| {
        REAL_MAIN.store(m as usize, Ordering::Release);
        wrapped_main as MainFn
    });
    // SAFETY: forwards the loader's startup arguments.
    unsafe { real(main, argc, ubp_av, init, fini, rtld_fini, stack_end) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __cxa_atexit(
    func: Option<AtexitCallback>,
    arg: *mut c_void,
    dso_handle: *mut c_void,
) -> c_int {
    let _guard = ReentrancyGuard::enter();
    let Some(real) = interpose::real___cxa_atexit() else {
        diag::die(&ShimError::SymbolUnresolved("__cxa_atexit"));
    };
    // SAFETY: forwards the caller's arguments unchanged.
    unsafe { real(func, arg, dso_handle) }
}

/// `atexit(f)` is `__cxa_atexit(f, NULL, NULL)`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn atexit(func: Option<HookFn>) -> c_int {
    let _guard = ReentrancyGuard::enter();
    let Some(real) = interpose::real___cxa_atexit() else {
        diag::die(&ShimError::SymbolUnresolved("__cxa_atexit"));
    };
    // SAFETY: a C function taking no arguments may be called with one ignored
    // pointer argument on every supported ABI.
    let func = func.map(|f| unsafe { std::mem::transmute::<HookFn, AtexitCallback>(f) });
    // SAFETY: forwards to the real registration function.
    unsafe { real(func, std::ptr::null_mut(), std::ptr::null_mut()) }
}

/// glibc only ships `pthread_atfork` in `libc_nonshared.a`; the dynamic entry
/// point behind it is `__register_atfork`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_atfork(
    prepare: Option<ForkHook>,
    parent: Option<ForkHook>,
    child: Option<ForkHook>,
) -> c_int {
    let _guard = ReentrancyGuard::enter();
    let Some(real) = interpose::real___register_atfork() else {
        diag::die(&ShimError::SymbolUnresolved("__register_atfork"));
    };
    // SAFETY: a null DSO handle registers the hooks for the whole process.
    unsafe { real(prepare, parent, child, std::ptr::null_mut()) }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_atfork(
    prepare: Option<ForkHook>,
    parent: Option<ForkHook>,
    child: Option<ForkHook>,
) -> c_int {
    let _guard = ReentrancyGuard::enter();
    let Some(real) = interpose::real_pthread_atfork() else {
        diag::die(&ShimError::SymbolUnresolved("pthread_atfork"));
    };
    // SAFETY: forwards the caller's arguments unchanged.
    unsafe { real(prepare, parent, child) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn strerror(errnum: c_int) -> *mut c_char {
    let _guard = ReentrancyGuard::enter();
    let Some(real) = interpose::real_strerror() else {
        diag::die(&ShimError::SymbolUnresolved("strerror"));
    };
    // SAFETY: forwards the caller's argument unchanged.
    unsafe { real(errnum) }
}
