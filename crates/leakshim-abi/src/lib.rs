// Every export takes raw pointers straight from C callers; per-function safety docs
// would repeat the C contract of the intercepted symbol.
#![allow(clippy::missing_safety_doc)]
//! # leakshim-abi
//!
//! `extern "C"` interception boundary for leakshim, built as `libleakshim_abi.so`
//! and loaded with `LD_PRELOAD`.
//!
//! # Architecture
//!
//! ```text
//! program -> interceptor (this crate) -> bootstrap arena   (while initializing)
//!                                     -> leak engine       (tracked, with call-site)
//!                                     -> real symbol       (dlsym(RTLD_NEXT, ..))
//! ```
//!
//! Symbols are exported only in release builds. Debug builds (and so the
//! integration tests) keep every interceptor as a plain Rust function, so the test
//! binary's own `malloc` and `pthread_create` stay the system ones.

mod backing;
pub mod interpose;
pub mod runtime_state;

pub mod interface_abi;

pub mod malloc_abi;
#[cfg(target_pointer_width = "64")]
pub mod operator_abi;
pub mod process_abi;
pub mod pthread_abi;
pub mod shim_abi;

pub use backing::{GlibcBacking, InternalAllocator};

/// The shim's own Rust allocations go straight to glibc and never reach the
/// interceptors.
#[global_allocator]
static INTERNAL_ALLOCATOR: InternalAllocator = InternalAllocator;

#[inline]
pub(crate) unsafe fn set_abi_errno(val: std::ffi::c_int) {
    // SAFETY: `__errno_location` returns a valid TLS errno pointer.
    unsafe { *libc::__errno_location() = val };
}
