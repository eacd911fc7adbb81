#![cfg(all(target_os = "linux", target_pointer_width = "64"))]

mod common;

use leakshim_abi::operator_abi::*;
use leakshim_abi::runtime_state;

#[test]
fn new_and_delete_pair_up() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let scalar = _Znwm(24);
        let array = _Znam(100);
        assert_eq!(runtime_state::engine().lookup(scalar).unwrap().size, 24);
        assert_eq!(runtime_state::engine().lookup(array).unwrap().size, 100);
        _ZdlPvm(scalar, 24);
        _ZdaPv(array);
        assert!(runtime_state::engine().lookup(scalar).is_none());
        assert!(runtime_state::engine().lookup(array).is_none());
    }
}

#[test]
fn aligned_new_honours_alignment() {
    let _guard = common::acquire_test_guard();
    unsafe {
        let p = _ZnwmSt11align_val_t(40, 256);
        assert_eq!(p as usize % 256, 0);
        _ZdlPvSt11align_val_t(p, 256);

        let q = _ZnamSt11align_val_tRKSt9nothrow_t(8, 64, std::ptr::null());
        assert_eq!(q as usize % 64, 0);
        _ZdaPvmSt11align_val_t(q, 8, 64);
    }
}

#[test]
fn nothrow_new_returns_null_on_failure() {
    let _guard = common::acquire_test_guard();
    unsafe {
        assert!(_ZnwmRKSt9nothrow_t(usize::MAX - 4096, std::ptr::null()).is_null());
        assert!(_ZnamRKSt9nothrow_t(usize::MAX - 4096, std::ptr::null()).is_null());
    }
}

#[test]
fn every_delete_accepts_null() {
    let _guard = common::acquire_test_guard();
    let null = std::ptr::null_mut();
    let tag = std::ptr::null();
    unsafe {
        _ZdlPv(null);
        _ZdaPv(null);
        _ZdlPvRKSt9nothrow_t(null, tag);
        _ZdaPvRKSt9nothrow_t(null, tag);
        _ZdlPvm(null, 0);
        _ZdaPvm(null, 0);
        _ZdlPvSt11align_val_t(null, 16);
        _ZdaPvSt11align_val_t(null, 16);
        _ZdlPvSt11align_val_tRKSt9nothrow_t(null, 16, tag);
        _ZdaPvSt11align_val_tRKSt9nothrow_t(null, 16, tag);
        _ZdlPvmSt11align_val_t(null, 0, 16);
        _ZdaPvmSt11align_val_t(null, 0, 16);
    }
}

const OOM_CHILD_ENV: &str = "LEAKSHIM_TEST_OOM_CHILD";
const OOM_EXITCODE: i32 = 57;

#[test]
fn throwing_new_reports_oom_and_exits() {
    if std::env::var_os(OOM_CHILD_ENV).is_some() {
        common::install_config(leakshim_core::config::LeakConfig {
            exitcode: OOM_EXITCODE,
            ..common::quiet_config()
        });
        let _guard = common::acquire_test_guard();
        unsafe { _Znwm(usize::MAX / 2) };
        unreachable!("throwing operator new returned");
    }

    let output = std::process::Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "throwing_new_reports_oom_and_exits",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(OOM_CHILD_ENV, "1")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(OOM_EXITCODE), "stderr: {stderr}");
    assert!(stderr.contains("out of memory"), "stderr: {stderr}");
}
