//! Leak-tracking engine interface.
//!
//! The interception layer talks to the engine only through [`LeakEngine`]. The
//! reference implementation, [`CountingEngine`], reports live allocations that a
//! conservative scan of root regions and writable globals cannot reach.
//!
//! Engine methods are entered from inside `malloc`/`free`, so implementations must
//! not allocate through the intercepted entry points on those paths.

mod counting;
pub mod report;
mod roots;
pub mod scan;
mod table;
mod threads;

use std::ffi::c_void;
use std::fmt;

use crate::callsite::CallSite;

pub use counting::{CountingEngine, EngineStats};
pub use report::{LeakGroup, LeakSummary};
pub use roots::{ROOT_REGION_CAPACITY, RootRegionTable};
pub use table::{AllocationTable, LiveAllocation};
pub use threads::{ThreadRecord, ThreadRegistry, ThreadState};

/// Engine-assigned thread identifier. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Reserved for the main thread; never handed to a created thread.
    pub const MAIN: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Memory the engine must treat as a root (bootstrap allocations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRegion {
    pub base: usize,
    pub size: usize,
}

impl RootRegion {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// One allocation request as forwarded by an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: usize,
    /// Required alignment; 0 means the default malloc alignment.
    pub align: usize,
    pub zeroed: bool,
    /// Made while the reentrancy guard was held; never reported.
    pub ignored: bool,
}

impl AllocRequest {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            align: 0,
            zeroed: false,
            ignored: false,
        }
    }

    #[must_use]
    pub const fn aligned(size: usize, align: usize) -> Self {
        Self {
            size,
            align,
            zeroed: false,
            ignored: false,
        }
    }

    #[must_use]
    pub const fn zeroed(mut self) -> Self {
        self.zeroed = true;
        self
    }

    #[must_use]
    pub const fn ignored(mut self, ignored: bool) -> Self {
        self.ignored = ignored;
        self
    }
}

/// Root-region bookkeeping, split out so the bootstrap allocator can depend on
/// just this half of the engine.
pub trait RootRegistry {
    fn register_root_region(&self, base: *const c_void, size: usize);
    fn unregister_root_region(&self, base: *const c_void, size: usize);
}

pub trait LeakEngine: RootRegistry + Sync {
    fn is_initialized(&self) -> bool;

    /// Complete engine setup. Idempotent; `main_os_id` is the OS id of the thread
    /// registered as [`ThreadId::MAIN`].
    fn lazy_initialize(&self, main_os_id: u64);

    /// Allocate and record a block.
    ///
    /// # Safety
    ///
    /// The returned block is raw memory owned by the caller until passed back to
    /// [`LeakEngine::track_free`] or [`LeakEngine::track_reallocate`].
    unsafe fn track_allocate(&self, request: AllocRequest, trace: &CallSite) -> *mut c_void;

    /// Forget and release a block. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this engine.
    unsafe fn track_free(&self, ptr: *mut c_void);

    /// Move a block to a new size, preserving the common prefix.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this engine. On success the
    /// old block is released.
    unsafe fn track_reallocate(
        &self,
        ptr: *mut c_void,
        size: usize,
        trace: &CallSite,
        ignored: bool,
    ) -> *mut c_void;

    /// Requested size of a live block, 0 if unknown.
    fn usable_size(&self, ptr: *const c_void) -> usize;

    fn thread_create(&self, parent: ThreadId, detached: bool) -> ThreadId;
    fn thread_start(&self, id: ThreadId, os_id: u64);
    fn thread_finish(&self, id: ThreadId);

    /// Run a leak check, print the report, and latch the reported-leaks flag.
    fn do_leak_check(&self) -> LeakSummary;
    fn has_reported_leaks(&self) -> bool;
    fn configured_leak_exit_code(&self) -> i32;
}

/// Raw memory source underneath the reference engine.
///
/// # Safety
///
/// `allocate` must return null or a block of at least `size` bytes aligned to
/// `align`, and `release`/`usable_size` must accept exactly those blocks.
pub unsafe trait Backing: Sync {
    unsafe fn allocate(&self, size: usize, align: usize) -> *mut c_void;
    unsafe fn release(&self, ptr: *mut c_void);
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

/// Backing over the process allocator, through `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBacking;

// SAFETY: posix_memalign/free/malloc_usable_size agree on block ownership.
unsafe impl Backing for SystemBacking {
    unsafe fn allocate(&self, size: usize, align: usize) -> *mut c_void {
        let align = align.max(std::mem::size_of::<usize>());
        let mut out: *mut c_void = std::ptr::null_mut();
        // SAFETY: `align` is a power of two multiple of the pointer size.
        let rc = unsafe { libc::posix_memalign(&mut out, align, size) };
        if rc == 0 { out } else { std::ptr::null_mut() }
    }

    unsafe fn release(&self, ptr: *mut c_void) {
        // SAFETY: caller passes a block from `allocate`.
        unsafe { libc::free(ptr) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        // SAFETY: caller passes a block from `allocate`.
        unsafe { libc::malloc_usable_size(ptr) }
    }
}

/// Minimum alignment handed out by the engine.
pub const MIN_ALIGNMENT: usize = 16;
