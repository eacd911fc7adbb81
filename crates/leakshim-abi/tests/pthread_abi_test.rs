#![cfg(target_os = "linux")]

mod common;

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use leakshim_abi::pthread_abi::{pthread_create, pthread_join};
use leakshim_abi::runtime_state;
use leakshim_core::engine::ThreadId;
use leakshim_core::reentrancy::ThreadContext;

static SEEN_ID: AtomicU32 = AtomicU32::new(u32::MAX);
static DETACHED_DONE: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn record_id(arg: *mut c_void) -> *mut c_void {
    SEEN_ID.store(ThreadContext::current_thread().get(), Ordering::SeqCst);
    arg
}

unsafe extern "C" fn detached_body(_arg: *mut c_void) -> *mut c_void {
    DETACHED_DONE.store(true, Ordering::SeqCst);
    std::ptr::null_mut()
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out");
        std::thread::yield_now();
    }
}

#[test]
fn created_thread_checks_in_and_finishes() {
    let _guard = common::acquire_test_guard();
    let before = runtime_state::engine_stats();
    unsafe {
        let mut tid = MaybeUninit::<libc::pthread_t>::uninit();
        let rc = pthread_create(tid.as_mut_ptr(), std::ptr::null(), Some(record_id), 0x51 as *mut c_void);
        assert_eq!(rc, 0);
        let mut ret: *mut c_void = std::ptr::null_mut();
        assert_eq!(pthread_join(tid.assume_init(), &mut ret), 0);
        assert_eq!(ret as usize, 0x51);
    }
    let child = SEEN_ID.load(Ordering::SeqCst);
    assert_ne!(child, ThreadId::MAIN.get());
    assert_ne!(child, u32::MAX);

    let after = runtime_state::engine_stats();
    assert_eq!(after.threads_created, before.threads_created + 1);
    // Destructors have run by the time join returns.
    assert_eq!(after.threads_finished, before.threads_finished + 1);
    let record = runtime_state::engine().threads().get(ThreadId::new(child));
    assert!(record.is_none(), "finished threads are dropped from the registry");
}

#[test]
fn detached_threads_are_recorded_as_detached() {
    let _guard = common::acquire_test_guard();
    let before = runtime_state::engine_stats();
    unsafe {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        assert_eq!(libc::pthread_attr_init(attr.as_mut_ptr()), 0);
        libc::pthread_attr_setdetachstate(attr.as_mut_ptr(), libc::PTHREAD_CREATE_DETACHED);
        let mut tid = MaybeUninit::<libc::pthread_t>::uninit();
        let rc = pthread_create(tid.as_mut_ptr(), attr.as_ptr(), Some(detached_body), std::ptr::null_mut());
        assert_eq!(rc, 0);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
    }
    wait_until(|| runtime_state::engine_stats().threads_finished > before.threads_finished);
    assert!(DETACHED_DONE.load(Ordering::SeqCst));
    assert_eq!(runtime_state::engine_stats().threads_created, before.threads_created + 1);
}

#[test]
fn c11_attribute_sentinel_is_replaced() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let mut tid = MaybeUninit::<libc::pthread_t>::uninit();
        let sentinel = usize::MAX as *const libc::pthread_attr_t;
        let rc = pthread_create(tid.as_mut_ptr(), sentinel, Some(record_id), std::ptr::null_mut());
        assert_eq!(rc, 0);
        assert_eq!(pthread_join(tid.assume_init(), std::ptr::null_mut()), 0);
    }
}

#[test]
fn missing_entry_point_is_rejected() {
    let _guard = common::acquire_test_guard();
    let before = runtime_state::engine_stats();
    unsafe {
        let mut tid = MaybeUninit::<libc::pthread_t>::uninit();
        assert_eq!(
            pthread_create(tid.as_mut_ptr(), std::ptr::null(), None, std::ptr::null_mut()),
            libc::EINVAL
        );
    }
    assert_eq!(runtime_state::engine_stats().threads_created, before.threads_created);
}

#[test]
fn failed_creation_leaves_no_bookkeeping() {
    let _guard = common::acquire_test_guard();
    let before = runtime_state::engine_stats();
    unsafe {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        assert_eq!(libc::pthread_attr_init(attr.as_mut_ptr()), 0);
        // An absurd stack size makes the real pthread_create fail.
        libc::pthread_attr_setstacksize(attr.as_mut_ptr(), usize::MAX / 2);
        let mut tid = MaybeUninit::<libc::pthread_t>::uninit();
        let rc = pthread_create(tid.as_mut_ptr(), attr.as_ptr(), Some(record_id), std::ptr::null_mut());
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        assert_ne!(rc, 0);
    }
    assert_eq!(runtime_state::engine_stats().threads_created, before.threads_created);
}
