//! # leakshim-core
//!
//! Allocation and thread-lifecycle interception logic for a runtime leak detector.
//!
//! This crate holds everything the preload shim needs that can be expressed without
//! exporting C symbols: the engine interface and its reference implementation, the
//! bootstrap arena used before initialization, the per-thread reentrancy guard, the
//! thread-creation handoff protocol and the exit-status policy. The `leakshim-abi`
//! crate wires these to the `extern "C"` entry points.
//!
//! Nothing in the allocation paths of this crate allocates through the process heap.

pub mod bootstrap;
pub mod callsite;
pub mod capability;
pub mod config;
#[macro_use]
pub mod diag;
pub mod engine;
pub mod error;
pub mod exit;
pub mod lifecycle;
pub mod reentrancy;

pub use bootstrap::{BootstrapAllocator, BootstrapStats};
pub use callsite::CallSite;
pub use config::LeakConfig;
pub use engine::{
    AllocRequest, CountingEngine, LeakEngine, LeakSummary, RootRegistry, SystemBacking, ThreadId,
};
pub use error::ShimError;
pub use exit::ExitStatus;
pub use reentrancy::{ReentrancyGuard, ThreadContext};
