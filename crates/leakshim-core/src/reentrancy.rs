//! Per-thread interception context and the reentrancy guard.
//!
//! Each thread carries a [`ThreadContext`] holding its reentrancy depth and the
//! identifier the engine assigned it. The thread-local is const-initialized and has
//! no destructor, so it is usable from the very first allocation a thread makes and
//! still usable while the thread's other TLS is being torn down.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::engine::ThreadId;

pub struct ThreadContext {
    depth: Cell<u32>,
    thread_id: Cell<Option<ThreadId>>,
}

thread_local! {
    static CONTEXT: ThreadContext = const {
        ThreadContext {
            depth: Cell::new(0),
            thread_id: Cell::new(None),
        }
    };
}

impl ThreadContext {
    /// Run `f` against the calling thread's context.
    pub fn with<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
        CONTEXT.with(f)
    }

    #[must_use]
    pub fn is_guarded(&self) -> bool {
        self.depth.get() > 0
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get()
    }

    pub fn set_thread_id(&self, id: Option<ThreadId>) {
        self.thread_id.set(id);
    }

    /// Identifier of the calling thread. Threads the tracker never saw start
    /// (including the main thread) report [`ThreadId::MAIN`].
    #[must_use]
    pub fn current_thread() -> ThreadId {
        Self::with(|ctx| ctx.thread_id().unwrap_or(ThreadId::MAIN))
    }
}

/// Scoped reentrancy token.
///
/// While any guard is alive on a thread, allocations made by that thread are
/// forwarded untraced and marked ignored, and the thread tracker performs no
/// bookkeeping. Guards nest; the flag clears when the outermost one drops.
pub struct ReentrancyGuard {
    // Tied to the thread whose depth it incremented.
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Take the guard unconditionally (nesting allowed).
    #[must_use]
    pub fn enter() -> Self {
        ThreadContext::with(|ctx| ctx.depth.set(ctx.depth.get().saturating_add(1)));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Take the guard only if the thread does not already hold it.
    ///
    /// `None` means the caller is nested inside interception machinery.
    #[must_use]
    pub fn try_enter() -> Option<Self> {
        ThreadContext::with(|ctx| {
            if ctx.is_guarded() {
                None
            } else {
                ctx.depth.set(1);
                Some(Self {
                    _not_send: PhantomData,
                })
            }
        })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        ThreadContext::with(|ctx| ctx.depth.set(ctx.depth.get().saturating_sub(1)));
    }
}

/// Whether the calling thread currently holds the guard.
#[must_use]
pub fn is_held() -> bool {
    ThreadContext::with(ThreadContext::is_guarded)
}
