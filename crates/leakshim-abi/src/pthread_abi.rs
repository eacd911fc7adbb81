//! Thread lifecycle interceptors.
//!
//! `pthread_create` runs the new thread through a trampoline that checks in with
//! the engine before the user's entry point; the engine's finish hook is deferred
//! to the last destructor pass of a dedicated TSD key.

use std::ffi::{c_int, c_void};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use leakshim_core::diag;
use leakshim_core::error::ShimError;
use leakshim_core::lifecycle::{
    self, FinalizeCountdown, FinalizeStep, StartRoutine, ThreadHandoff,
};
use leakshim_core::reentrancy::{self, ReentrancyGuard, ThreadContext};

use crate::interpose;
use crate::runtime_state;

unsafe extern "C" {
    fn pthread_attr_getdetachstate(attr: *const libc::pthread_attr_t, state: *mut c_int) -> c_int;
}

/// Detach state recorded in `attr`; joinable when it cannot be read.
fn detach_state_of(attr: *const libc::pthread_attr_t) -> c_int {
    let mut state = libc::PTHREAD_CREATE_JOINABLE;
    // SAFETY: `attr` is an initialized attribute object; `state` is a valid out-pointer.
    let rc = unsafe { pthread_attr_getdetachstate(attr, &mut state) };
    if rc == 0 { state } else { libc::PTHREAD_CREATE_JOINABLE }
}

/// glibc's `__ATTRP_C11_THREAD`: the attribute pointer `thrd_create` passes.
const C11_THREAD_ATTR: usize = usize::MAX;

static FINALIZE_KEY: AtomicU32 = AtomicU32::new(0);
static FINALIZE_KEY_READY: AtomicBool = AtomicBool::new(false);

/// Create the TSD key whose destructor drives the per-thread finish countdown.
pub(crate) fn create_finalize_key() -> Result<(), ShimError> {
    if FINALIZE_KEY_READY.load(Ordering::Acquire) {
        return Ok(());
    }
    let mut key: libc::pthread_key_t = 0;
    // SAFETY: `key` is a valid out-pointer; the destructor has the TSD signature.
    let rc = unsafe { libc::pthread_key_create(&mut key, Some(thread_finalize)) };
    if rc != 0 {
        return Err(ShimError::KeyCreate(rc));
    }
    FINALIZE_KEY.store(key as u32, Ordering::Relaxed);
    FINALIZE_KEY_READY.store(true, Ordering::Release);
    Ok(())
}

fn set_finalize_value(countdown: FinalizeCountdown) {
    if !FINALIZE_KEY_READY.load(Ordering::Acquire) {
        return;
    }
    let key = FINALIZE_KEY.load(Ordering::Relaxed) as libc::pthread_key_t;
    // SAFETY: the key was created by `create_finalize_key`; the value is an integer.
    let rc = unsafe { libc::pthread_setspecific(key, countdown.raw() as *const c_void) };
    if rc != 0 {
        diag::die(&ShimError::KeySet(rc));
    }
}

unsafe extern "C" fn thread_finalize(value: *mut c_void) {
    match FinalizeCountdown::from_raw(value as usize).step() {
        FinalizeStep::Rearm(next) => set_finalize_value(FinalizeCountdown::from_raw(next)),
        FinalizeStep::Finish => {
            lifecycle::finish_thread(runtime_state::engine());
        }
    }
}

unsafe extern "C" fn thread_start_trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the parent's stack handoff, alive until we acknowledge.
    let handoff = unsafe { &*arg.cast::<ThreadHandoff>() };
    #[cfg(not(any(target_os = "netbsd", target_os = "freebsd")))]
    set_finalize_value(FinalizeCountdown::ARMED);
    let (entry, param) = lifecycle::begin_child(
        runtime_state::engine(),
        handoff,
        runtime_state::current_os_thread_id(),
    );
    // SAFETY: the caller's entry point with the caller's argument.
    unsafe { entry(param) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_create(
    thread_out: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    runtime_state::ensure_initialized();
    let Some(real_create) = interpose::real_pthread_create() else {
        diag::die(&ShimError::SymbolUnresolved("pthread_create"));
    };
    let Some(start_routine) = start_routine else {
        return libc::EINVAL;
    };
    if reentrancy::is_held() {
        // Created by shim machinery: not tracked.
        // SAFETY: forwards the caller's arguments unchanged.
        return unsafe { real_create(thread_out, attr, start_routine, arg) };
    }

    let mut local_attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    let substituted = attr.is_null() || attr as usize == C11_THREAD_ATTR;
    let attr = if substituted {
        // SAFETY: initializes the local attribute object in place.
        unsafe { libc::pthread_attr_init(local_attr.as_mut_ptr()) };
        local_attr.as_ptr()
    } else {
        attr
    };
    let detach_state = detach_state_of(attr);

    let handoff = ThreadHandoff::new(start_routine, arg);
    let rc = {
        let _guard = ReentrancyGuard::enter();
        // SAFETY: `handoff` outlives the child's use of it: the parent waits for the
        // acknowledgement below before returning.
        unsafe {
            real_create(
                thread_out,
                attr,
                thread_start_trampoline,
                (&raw const handoff).cast_mut().cast(),
            )
        }
    };
    if rc == 0 {
        let parent = ThreadContext::current_thread();
        let detached = detach_state == libc::PTHREAD_CREATE_DETACHED;
        if let Err(err) =
            lifecycle::confirm_launch(runtime_state::engine(), &handoff, parent, detached)
        {
            diag::die(&err);
        }
    }
    if substituted {
        // SAFETY: initialized above.
        unsafe { libc::pthread_attr_destroy(local_attr.as_mut_ptr()) };
    }
    rc
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_join(thread: libc::pthread_t, retval: *mut *mut c_void) -> c_int {
    let Some(real_join) = interpose::real_pthread_join() else {
        diag::die(&ShimError::SymbolUnresolved("pthread_join"));
    };
    // SAFETY: forwards the caller's arguments unchanged.
    unsafe { real_join(thread, retval) }
}

#[cfg(target_os = "netbsd")]
static REAL_LWP_EXIT: interpose::RealSymbol = interpose::RealSymbol::new(c"_lwp_exit");

/// NetBSD: finish the thread directly, there is no destructor countdown.
#[cfg(target_os = "netbsd")]
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn _lwp_exit() -> ! {
    runtime_state::ensure_initialized();
    lifecycle::finish_thread(runtime_state::engine());
    let Some(addr) = REAL_LWP_EXIT.address() else {
        diag::die(&ShimError::SymbolUnresolved("_lwp_exit"));
    };
    // SAFETY: the real `_lwp_exit` has this signature.
    let real: unsafe extern "C" fn() -> ! = unsafe { std::mem::transmute(addr) };
    unsafe { real() }
}

#[cfg(target_os = "freebsd")]
static REAL_THR_EXIT: interpose::RealSymbol = interpose::RealSymbol::new(c"thr_exit");

/// FreeBSD: finish the thread directly, there is no destructor countdown.
#[cfg(target_os = "freebsd")]
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn thr_exit(state: *mut std::ffi::c_long) -> ! {
    runtime_state::ensure_initialized();
    lifecycle::finish_thread(runtime_state::engine());
    let Some(addr) = REAL_THR_EXIT.address() else {
        diag::die(&ShimError::SymbolUnresolved("thr_exit"));
    };
    // SAFETY: the real `thr_exit` has this signature.
    let real: unsafe extern "C" fn(*mut std::ffi::c_long) -> ! =
        unsafe { std::mem::transmute(addr) };
    unsafe { real(state) }
}
