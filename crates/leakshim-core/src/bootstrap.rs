//! Bootstrap allocator.
//!
//! Serves allocations made while the shim is still initializing (the loader and
//! `dlsym` allocate before the engine can). Memory comes from a static arena with a
//! bump cursor; each block carries a 16-byte header with its size and a marker so
//! `owns` can recognize the arena's own blocks later, after initialization has
//! finished and frees start arriving through the normal interceptors.
//!
//! Every live block is registered with the engine as a root region so anything it
//! points to is never considered leaked.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::engine::RootRegistry;

pub const BOOTSTRAP_ARENA_BYTES: usize = 128 * 1024;

const ALIGN: usize = 16;
const HEADER: usize = 16;
const MAGIC_LIVE: usize = 0x6c73_686d_6c69_7665;
const MAGIC_FREED: usize = 0x6c73_686d_6672_6565;

#[repr(C, align(16))]
struct Arena<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootstrapStats {
    /// Arena bytes handed out so far, headers included.
    pub allocated_bytes: usize,
    pub live_blocks: usize,
}

pub struct BootstrapAllocator<const N: usize = BOOTSTRAP_ARENA_BYTES> {
    arena: Arena<N>,
    cursor: AtomicUsize,
    live_blocks: AtomicUsize,
    active: AtomicBool,
}

// SAFETY: arena bytes are only written inside blocks reserved by a successful
// CAS on `cursor`, so no two threads write the same range.
unsafe impl<const N: usize> Sync for BootstrapAllocator<N> {}

/// Keeps bootstrap mode on while alive.
pub struct BootstrapMode<'a, const N: usize> {
    owner: &'a BootstrapAllocator<N>,
}

impl<const N: usize> Drop for BootstrapMode<'_, N> {
    fn drop(&mut self) {
        self.owner.active.store(false, Ordering::Release);
    }
}

impl<const N: usize> BootstrapAllocator<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arena: Arena {
                bytes: UnsafeCell::new([0; N]),
            },
            cursor: AtomicUsize::new(0),
            live_blocks: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Route fresh allocations here until the returned token drops.
    #[must_use]
    pub fn enter_bootstrap_mode(&self) -> BootstrapMode<'_, N> {
        self.active.store(true, Ordering::Release);
        BootstrapMode { owner: self }
    }

    /// Whether bootstrap mode is active.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn base(&self) -> usize {
        self.arena.bytes.get() as usize
    }

    #[must_use]
    pub fn stats(&self) -> BootstrapStats {
        BootstrapStats {
            allocated_bytes: self.cursor.load(Ordering::Relaxed),
            live_blocks: self.live_blocks.load(Ordering::Relaxed),
        }
    }

    fn header(&self, ptr: *const c_void) -> Option<*mut usize> {
        let addr = ptr as usize;
        let base = self.base();
        let end = base + self.cursor.load(Ordering::Acquire);
        if addr < base + HEADER || addr >= end || (addr - base) % ALIGN != 0 {
            return None;
        }
        Some((addr - HEADER) as *mut usize)
    }

    /// Whether `ptr` is a live block from this arena.
    #[must_use]
    pub fn owns(&self, ptr: *const c_void) -> bool {
        let Some(hdr) = self.header(ptr) else {
            return false;
        };
        // SAFETY: header lies inside the reserved part of the arena.
        let marker = unsafe { hdr.add(1).read_volatile() };
        marker == MAGIC_LIVE
    }

    /// Recorded size of a live block, 0 for foreign pointers.
    #[must_use]
    pub fn usable_size(&self, ptr: *const c_void) -> usize {
        if !self.owns(ptr) {
            return 0;
        }
        match self.header(ptr) {
            // SAFETY: owned block; header was written by `allocate`.
            Some(hdr) => unsafe { hdr.read() },
            None => 0,
        }
    }

    /// Bump-allocate `size` bytes (at least 1). Null when the arena is exhausted.
    pub fn allocate(&self, size: usize, roots: &(impl RootRegistry + ?Sized)) -> *mut c_void {
        let Some(payload) = size.max(1).checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1)) else {
            return std::ptr::null_mut();
        };
        let Some(block) = payload.checked_add(HEADER) else {
            return std::ptr::null_mut();
        };
        let mut start = self.cursor.load(Ordering::Relaxed);
        loop {
            let end = match start.checked_add(block) {
                Some(end) if end <= N => end,
                _ => return std::ptr::null_mut(),
            };
            match self
                .cursor
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => start = current,
            }
        }
        let hdr = (self.base() + start) as *mut usize;
        // SAFETY: [start, start + block) was reserved exclusively by the CAS above
        // and is 16-byte aligned.
        unsafe {
            hdr.write(size);
            hdr.add(1).write_volatile(MAGIC_LIVE);
        }
        let ptr = (self.base() + start + HEADER) as *mut c_void;
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        roots.register_root_region(ptr, size);
        ptr
    }

    /// Allocate `count * size` zeroed bytes. Null on overflow or exhaustion.
    pub fn allocate_zeroed(
        &self,
        count: usize,
        size: usize,
        roots: &(impl RootRegistry + ?Sized),
    ) -> *mut c_void {
        let Some(total) = count.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        let ptr = self.allocate(total, roots);
        if !ptr.is_null() {
            // SAFETY: block has at least `total` bytes; reclaimed tails may be dirty.
            unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, total) };
        }
        ptr
    }

    /// Return a block. Foreign and already-freed pointers are ignored.
    pub fn free(&self, ptr: *mut c_void, roots: &(impl RootRegistry + ?Sized)) {
        let Some(hdr) = self.header(ptr) else {
            return;
        };
        // SAFETY: header lies inside the reserved part of the arena.
        let size = unsafe {
            let marker = hdr.add(1);
            if marker.read_volatile() != MAGIC_LIVE {
                return;
            }
            marker.write_volatile(MAGIC_FREED);
            hdr.read()
        };
        roots.unregister_root_region(ptr, size);
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);

        // The most recent block can be handed back to the cursor.
        let start = hdr as usize - self.base();
        let payload = (size.max(1) + ALIGN - 1) & !(ALIGN - 1);
        let end = start + HEADER + payload;
        let _ = self
            .cursor
            .compare_exchange(end, start, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// `realloc` semantics inside the arena.
    pub fn reallocate(
        &self,
        ptr: *mut c_void,
        size: usize,
        roots: &(impl RootRegistry + ?Sized),
    ) -> *mut c_void {
        if ptr.is_null() {
            return self.allocate(size, roots);
        }
        if size == 0 {
            self.free(ptr, roots);
            return std::ptr::null_mut();
        }
        if !self.owns(ptr) {
            return std::ptr::null_mut();
        }
        let old = self.usable_size(ptr);
        let new = self.allocate(size, roots);
        if new.is_null() {
            return new;
        }
        // SAFETY: distinct live blocks, each at least min(old, size) bytes.
        unsafe { std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), old.min(size)) };
        self.free(ptr, roots);
        new
    }
}

impl<const N: usize> Default for BootstrapAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
