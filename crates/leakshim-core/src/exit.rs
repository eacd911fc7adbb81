//! Process exit status policy.
//!
//! Only a successful status is ever rewritten: a program that exits 0 after leaks
//! were reported exits with the configured leak exit code instead. Any non-zero
//! status is preserved unchanged.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::engine::LeakEngine;

pub const EXIT_SUCCESS: i32 = 0;

/// Status to hand to the real `_exit`.
#[must_use]
pub const fn resolve_exit_status(requested: i32, leaks_reported: bool, leak_exitcode: i32) -> i32 {
    if requested == EXIT_SUCCESS && leaks_reported {
        leak_exitcode
    } else {
        requested
    }
}

const RECORDED: u64 = 1 << 32;

/// Exit status requested by the program, recorded by the `exit` interceptor and by
/// the wrapped `main`, then resolved once by the at-exit leak check.
pub struct ExitStatus {
    // RECORDED | status as u32, or 0 when nothing was recorded.
    requested: AtomicU64,
    resolved: AtomicBool,
}

impl ExitStatus {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requested: AtomicU64::new(0),
            resolved: AtomicBool::new(false),
        }
    }

    pub fn record(&self, status: i32) {
        self.requested
            .store(RECORDED | u64::from(status as u32), Ordering::Release);
    }

    #[must_use]
    pub fn requested(&self) -> Option<i32> {
        let raw = self.requested.load(Ordering::Acquire);
        (raw & RECORDED != 0).then_some(raw as u32 as i32)
    }

    /// Resolve the final status against the engine. Only the first call resolves;
    /// later calls return `None`. An unrecorded status counts as success.
    pub fn resolve<E: LeakEngine + ?Sized>(&self, engine: &E) -> Option<i32> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return None;
        }
        let requested = self.requested().unwrap_or(EXIT_SUCCESS);
        Some(resolve_exit_status(
            requested,
            engine.has_reported_leaks(),
            engine.configured_leak_exit_code(),
        ))
    }

    /// Resolve, and return the status only when it differs from the one the
    /// program asked for (i.e. the exit must be overridden).
    pub fn leak_override<E: LeakEngine + ?Sized>(&self, engine: &E) -> Option<i32> {
        let requested = self.requested().unwrap_or(EXIT_SUCCESS);
        self.resolve(engine).filter(|&status| status != requested)
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::new()
    }
}
