#![cfg(target_os = "linux")]

mod common;

use std::ffi::c_void;

use leakshim_abi::malloc_abi::{
    aligned_alloc, calloc, free, malloc, malloc_usable_size, memalign, posix_memalign, pvalloc,
    realloc, reallocarray, valloc,
};
use leakshim_abi::runtime_state;
use leakshim_core::reentrancy::ReentrancyGuard;

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn clear_errno() {
    unsafe { *libc::__errno_location() = 0 };
}

fn page() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[test]
fn malloc_is_tracked_until_free() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let p = malloc(40);
        assert!(!p.is_null());
        let live = runtime_state::engine().lookup(p).expect("tracked");
        assert_eq!(live.size, 40);
        assert!(!live.ignored);
        assert!(!live.trace.is_empty(), "call-site captured");
        assert_eq!(malloc_usable_size(p), 40);

        free(p);
        assert!(runtime_state::engine().lookup(p).is_none());
    }
}

#[test]
fn zero_byte_malloc_returns_distinct_blocks() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let a = malloc(0);
        let b = malloc(0);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        free(a);
        free(b);
    }
}

#[test]
fn free_of_null_is_a_no_op() {
    let _guard = common::acquire_test_guard();
    let before = runtime_state::engine_stats();
    unsafe { free(std::ptr::null_mut()) };
    assert_eq!(runtime_state::engine_stats().live_allocations, before.live_allocations);
}

#[test]
fn calloc_zeroes_and_rejects_overflow() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let p = calloc(16, 8).cast::<u8>();
        assert!(!p.is_null());
        assert!(std::slice::from_raw_parts(p, 128).iter().all(|&b| b == 0));
        free(p.cast());

        clear_errno();
        assert!(calloc(usize::MAX, 2).is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }
}

#[test]
fn realloc_follows_c_semantics() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let p = realloc(std::ptr::null_mut(), 8).cast::<u8>();
        assert!(!p.is_null());
        for i in 0..8 {
            *p.add(i) = i as u8;
        }
        let q = realloc(p.cast(), 4096).cast::<u8>();
        assert!(!q.is_null());
        assert_eq!(std::slice::from_raw_parts(q, 8), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(malloc_usable_size(q.cast()), 4096);

        assert!(realloc(q.cast(), 0).is_null());
        assert!(runtime_state::engine().lookup(q.cast()).is_none());
    }
}

#[test]
fn reallocarray_overflow_sets_enomem() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let p = malloc(16);
        clear_errno();
        assert!(reallocarray(p, usize::MAX / 2, 4).is_null());
        assert_eq!(errno(), libc::ENOMEM);
        // The original block is untouched.
        assert!(runtime_state::engine().lookup(p).is_some());

        let q = reallocarray(p, 4, 8);
        assert!(!q.is_null());
        assert_eq!(malloc_usable_size(q), 32);
        free(q);
    }
}

#[test]
fn posix_memalign_validates_alignment() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let mut out: *mut c_void = std::ptr::null_mut();
        assert_eq!(posix_memalign(&mut out, 24, 64), libc::EINVAL);
        assert_eq!(posix_memalign(&mut out, 4, 64), libc::EINVAL);
        assert!(out.is_null());

        assert_eq!(posix_memalign(&mut out, 128, 64), 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 128, 0);
        free(out);
    }
}

#[test]
fn aligned_entry_points_reject_bad_requests() {
    let _guard = common::acquire_test_guard();
    unsafe {
        clear_errno();
        assert!(aligned_alloc(64, 100).is_null());
        assert_eq!(errno(), libc::EINVAL);

        clear_errno();
        assert!(memalign(48, 16).is_null());
        assert_eq!(errno(), libc::EINVAL);

        let p = aligned_alloc(64, 128);
        assert_eq!(p as usize % 64, 0);
        free(p);

        let q = memalign(256, 10);
        assert_eq!(q as usize % 256, 0);
        free(q);
    }
}

#[test]
fn page_aligned_allocations() {
    let _guard = common::acquire_test_guard();
    let page = page();
    unsafe {
        let v = valloc(10);
        assert_eq!(v as usize % page, 0);
        assert_eq!(malloc_usable_size(v), 10);
        free(v);

        let p = pvalloc(0);
        assert_eq!(p as usize % page, 0);
        assert_eq!(malloc_usable_size(p), page);
        free(p);

        let p = pvalloc(page + 1);
        assert_eq!(malloc_usable_size(p), 2 * page);
        free(p);

        clear_errno();
        assert!(pvalloc(usize::MAX - 1).is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }
}

#[test]
fn allocations_under_the_guard_are_ignored() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let p = {
            let _inside = ReentrancyGuard::enter();
            malloc(24)
        };
        let live = runtime_state::engine().lookup(p).expect("still recorded");
        assert!(live.ignored);
        assert!(live.trace.is_empty());
        free(p);
    }
}

#[test]
fn bootstrap_blocks_route_back_to_the_arena() {
    let _guard = common::acquire_test_guard();
    let bootstrap = runtime_state::bootstrap();
    let before = bootstrap.stats();
    unsafe {
        let p = {
            let _mode = bootstrap.enter_bootstrap_mode();
            malloc(48)
        };
        assert!(bootstrap.owns(p));
        assert!(runtime_state::engine().lookup(p).is_none());
        assert_eq!(malloc_usable_size(p), 48);
        assert!(runtime_state::engine().roots().contains(p as usize));

        // Outside bootstrap mode the pointer still goes home.
        let q = realloc(p, 96);
        assert!(bootstrap.owns(q));
        free(q);
    }
    assert_eq!(bootstrap.stats().live_blocks, before.live_blocks);
}

#[test]
fn engine_blocks_realloc_through_the_engine_in_bootstrap_mode() {
    let _guard = common::acquire_test_guard();
    let bootstrap = runtime_state::bootstrap();
    unsafe {
        let p = memalign(64, 40);
        assert!(runtime_state::engine().lookup(p).is_some());
        p.cast::<u8>().write_bytes(0x5a, 40);

        let (q, fresh) = {
            let _mode = bootstrap.enter_bootstrap_mode();
            (realloc(p, 200), realloc(std::ptr::null_mut(), 8))
        };
        assert!(!q.is_null());
        assert!(!bootstrap.owns(q));
        assert_eq!(runtime_state::engine().lookup(q).unwrap().size, 200);
        assert_eq!(std::slice::from_raw_parts(q.cast::<u8>(), 40), &[0x5a; 40][..]);
        // A fresh block requested in bootstrap mode still comes from the arena.
        assert!(bootstrap.owns(fresh));

        free(fresh);
        free(q);
    }
}
