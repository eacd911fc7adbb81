//! Thread lifecycle protocol.
//!
//! Creating a thread goes through five steps:
//!
//! ```text
//!   parent                                   child
//!   ──────                                   ─────
//!   Preparing   resolve attrs, detach state
//!   Launching   real pthread_create ───────▶ trampoline starts
//!               (under reentrancy guard)      arm finalize key
//!   Confirming  engine.thread_create              │
//!               publish id (release) ───────▶ wait for id (acquire)
//!                                             Running: record id, thread_start,
//!               wait for ack (acquire) ◀───── clear slot (release)
//!   return 0                                  call user entry point
//!                                             Finishing: finalize-key countdown,
//!                                             engine.thread_finish
//! ```
//!
//! The handoff lives on the parent's stack; the parent does not return until the
//! child has acknowledged, so the child never reads a dead frame.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::engine::{LeakEngine, ThreadId};
use crate::error::ShimError;
use crate::reentrancy::ThreadContext;

/// Maximum destructor-call iterations on thread exit (glibc value).
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 4;

/// C thread entry point.
pub type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

const SLOT_EMPTY: u32 = 0;

/// Parent-to-child handoff for one thread creation.
pub struct ThreadHandoff {
    callback: StartRoutine,
    param: *mut c_void,
    /// 0 until the parent publishes; reset to 0 by the child as acknowledgement.
    tid: AtomicU32,
}

// SAFETY: `param` is an opaque user pointer passed through to the new thread,
// exactly as pthread_create does.
unsafe impl Send for ThreadHandoff {}
// SAFETY: shared access only touches the atomic slot; callback/param are
// immutable after construction.
unsafe impl Sync for ThreadHandoff {}

impl ThreadHandoff {
    #[must_use]
    pub const fn new(callback: StartRoutine, param: *mut c_void) -> Self {
        Self {
            callback,
            param,
            tid: AtomicU32::new(SLOT_EMPTY),
        }
    }

    /// The user's entry point and argument.
    #[must_use]
    pub fn entry(&self) -> (StartRoutine, *mut c_void) {
        (self.callback, self.param)
    }

    /// Publish the assigned identifier to the child.
    pub fn publish(&self, id: ThreadId) {
        self.tid.store(id.get(), Ordering::Release);
    }

    /// Child: spin until the parent has published.
    pub fn wait_published(&self) -> ThreadId {
        loop {
            let raw = self.tid.load(Ordering::Acquire);
            if raw != SLOT_EMPTY {
                return ThreadId::new(raw);
            }
            std::thread::yield_now();
        }
    }

    /// Child: clear the slot, releasing the parent.
    pub fn acknowledge(&self) {
        self.tid.store(SLOT_EMPTY, Ordering::Release);
    }

    /// Parent: spin until the child has acknowledged.
    pub fn wait_acknowledged(&self) {
        while self.tid.load(Ordering::Acquire) != SLOT_EMPTY {
            std::thread::yield_now();
        }
    }
}

/// Confirming step, run by the parent after the real create succeeded.
///
/// Returns the identifier once the child has checked in.
pub fn confirm_launch<E: LeakEngine + ?Sized>(
    engine: &E,
    handoff: &ThreadHandoff,
    parent: ThreadId,
    detached: bool,
) -> Result<ThreadId, ShimError> {
    let id = engine.thread_create(parent, detached);
    if id == ThreadId::MAIN {
        return Err(ShimError::MainThreadIdCollision(parent.get()));
    }
    handoff.publish(id);
    handoff.wait_acknowledged();
    Ok(id)
}

/// Running step, run first thing on the new thread.
///
/// Returns the user's entry point; after the acknowledgement `handoff` must not be
/// touched again.
pub fn begin_child<E: LeakEngine + ?Sized>(
    engine: &E,
    handoff: &ThreadHandoff,
    os_id: u64,
) -> (StartRoutine, *mut c_void) {
    let entry = handoff.entry();
    let id = handoff.wait_published();
    ThreadContext::with(|ctx| ctx.set_thread_id(Some(id)));
    engine.thread_start(id, os_id);
    handoff.acknowledge();
    entry
}

/// What the finalize-key destructor does on one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStep {
    /// Store this value back into the key and wait for the next pass.
    Rearm(usize),
    /// Run the engine's finish hook now.
    Finish,
}

/// Per-thread destructor countdown stored as the finalize key's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeCountdown(usize);

impl FinalizeCountdown {
    /// Initial value armed by a newly started thread.
    pub const ARMED: Self = Self(PTHREAD_DESTRUCTOR_ITERATIONS);

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn step(self) -> FinalizeStep {
        if self.0 > 1 {
            FinalizeStep::Rearm(self.0 - 1)
        } else {
            FinalizeStep::Finish
        }
    }
}

/// Finishing step: tell the engine and forget the thread's identifier.
///
/// A thread whose identifier was already cleared is ignored, so the hook fires at
/// most once per thread.
pub fn finish_thread<E: LeakEngine + ?Sized>(engine: &E) -> Option<ThreadId> {
    let id = ThreadContext::with(|ctx| {
        let id = ctx.thread_id();
        ctx.set_thread_id(None);
        id
    })?;
    engine.thread_finish(id);
    Some(id)
}
