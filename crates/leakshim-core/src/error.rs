//! Internal failure taxonomy.
//!
//! Every variant here is fatal when it reaches an interceptor: the caller hands it
//! to [`crate::diag::die`], which reports it without allocating and terminates the
//! process with the configured exit code.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShimError {
    /// `pthread_key_create` for the finalize key failed.
    #[error("failed to create thread key (errno {0})")]
    KeyCreate(i32),
    /// Re-arming the finalize key during thread teardown failed.
    #[error("failed to set thread key (errno {0})")]
    KeySet(i32),
    /// The engine handed out the identifier reserved for the main thread.
    #[error("engine assigned the reserved main-thread identifier to a child of thread {0}")]
    MainThreadIdCollision(u32),
    /// `dlsym(RTLD_NEXT, ..)` found no definition behind the shim.
    #[error("unable to resolve real `{0}`")]
    SymbolUnresolved(&'static str),
    /// `dlsym(RTLD_NEXT, ..)` returned the interceptor itself.
    #[error("real `{0}` resolved back to the interceptor")]
    SelfResolved(&'static str),
    /// A throwing allocation entry point could not be satisfied.
    #[error("out of memory: allocator is trying to allocate {size:#x} bytes")]
    OutOfMemory { size: usize },
    /// The bootstrap arena ran dry before initialization completed.
    #[error("bootstrap arena exhausted while allocating {size} bytes")]
    BootstrapExhausted { size: usize },
}

impl ShimError {
    /// Short stable tag used in structured log records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::KeyCreate(_) => "key_create",
            Self::KeySet(_) => "key_set",
            Self::MainThreadIdCollision(_) => "main_thread_id_collision",
            Self::SymbolUnresolved(_) => "symbol_unresolved",
            Self::SelfResolved(_) => "self_resolved",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::BootstrapExhausted { .. } => "bootstrap_exhausted",
        }
    }
}
