#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use leakshim_core::config::{self, LeakConfig};

static TEST_GUARD_HELD: AtomicBool = AtomicBool::new(false);

pub struct TestGuard;

impl Drop for TestGuard {
    fn drop(&mut self) {
        TEST_GUARD_HELD.store(false, Ordering::Release);
    }
}

/// Serialize tests touching the process-wide shim state, and make sure the shim is
/// configured before the first interceptor runs.
pub fn acquire_test_guard() -> TestGuard {
    install_config(quiet_config());
    loop {
        if TEST_GUARD_HELD
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return TestGuard;
        }
        std::thread::yield_now();
    }
}

/// Defaults, minus the at-exit hook that would run in the test process.
pub fn quiet_config() -> LeakConfig {
    LeakConfig {
        leak_check_at_exit: false,
        ..LeakConfig::default()
    }
}

/// First install wins; later calls are no-ops.
pub fn install_config(config: LeakConfig) {
    let _ = config::install(&config);
}
