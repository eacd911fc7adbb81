//! glibc's internal allocator entry points.
//!
//! The public names (`malloc`, `__libc_memalign`, ...) are exported by this very
//! library in release builds, so the real implementations are bound by their
//! versioned `__libc_*` names instead.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;

use leakshim_core::engine::{Backing, MIN_ALIGNMENT};

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    #[link_name = "__libc_malloc@GLIBC_2.2.5"]
    fn native_libc_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc@GLIBC_2.2.5"]
    fn native_libc_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc@GLIBC_2.2.5"]
    fn native_libc_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "__libc_free@GLIBC_2.2.5"]
    fn native_libc_free_sym(ptr: *mut c_void);
    #[link_name = "__libc_memalign@GLIBC_2.2.5"]
    fn native_libc_memalign_sym(alignment: usize, size: usize) -> *mut c_void;
}

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    #[link_name = "__libc_malloc@GLIBC_2.17"]
    fn native_libc_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc@GLIBC_2.17"]
    fn native_libc_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc@GLIBC_2.17"]
    fn native_libc_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "__libc_free@GLIBC_2.17"]
    fn native_libc_free_sym(ptr: *mut c_void);
    #[link_name = "__libc_memalign@GLIBC_2.17"]
    fn native_libc_memalign_sym(alignment: usize, size: usize) -> *mut c_void;
}

#[inline]
pub(crate) unsafe fn native_libc_malloc(size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_malloc_sym(size) }
}

#[inline]
pub(crate) unsafe fn native_libc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_calloc_sym(nmemb, size) }
}

#[inline]
pub(crate) unsafe fn native_libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_realloc_sym(ptr, size) }
}

#[inline]
pub(crate) unsafe fn native_libc_free(ptr: *mut c_void) {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_free_sym(ptr) }
}

#[inline]
pub(crate) unsafe fn native_libc_memalign(alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_memalign_sym(alignment, size) }
}

/// Engine backing over glibc's allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlibcBacking;

// SAFETY: every block comes from glibc's malloc family and goes back to
// `__libc_free`; `malloc_usable_size` accepts all of them.
unsafe impl Backing for GlibcBacking {
    unsafe fn allocate(&self, size: usize, align: usize) -> *mut c_void {
        if align <= MIN_ALIGNMENT {
            // SAFETY: glibc malloc returns 16-byte aligned blocks on 64-bit targets.
            unsafe { native_libc_malloc(size) }
        } else {
            // SAFETY: `align` is a power of two.
            unsafe { native_libc_memalign(align, size) }
        }
    }

    unsafe fn release(&self, ptr: *mut c_void) {
        // SAFETY: `ptr` came from `allocate`.
        unsafe { native_libc_free(ptr) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        match crate::interpose::real_malloc_usable_size() {
            // SAFETY: `ptr` came from glibc.
            Some(f) => unsafe { f(ptr) },
            None => 0,
        }
    }
}

/// Global allocator for the shim's own Rust code.
pub struct InternalAllocator;

unsafe impl GlobalAlloc for InternalAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwards to glibc; alignment is a power of two by `Layout`.
        unsafe {
            if layout.align() <= MIN_ALIGNMENT && layout.align() <= layout.size() {
                native_libc_malloc(layout.size()).cast()
            } else {
                native_libc_memalign(layout.align(), layout.size()).cast()
            }
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGNMENT && layout.align() <= layout.size() {
            // SAFETY: forwards to glibc.
            unsafe { native_libc_calloc(1, layout.size()).cast() }
        } else {
            // SAFETY: `alloc` returns a block of `layout.size()` bytes or null.
            unsafe {
                let ptr = self.alloc(layout);
                if !ptr.is_null() {
                    std::ptr::write_bytes(ptr, 0, layout.size());
                }
                ptr
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` came from `alloc`.
        unsafe { native_libc_free(ptr.cast()) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGNMENT && layout.align() <= new_size {
            // SAFETY: `ptr` came from `alloc` with a malloc-compatible alignment.
            return unsafe { native_libc_realloc(ptr.cast(), new_size).cast() };
        }
        // SAFETY: new layout keeps the original alignment; copy the common prefix.
        unsafe {
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new = self.alloc(new_layout);
            if !new.is_null() {
                std::ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            new
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glibc_backing_respects_alignment() {
        let backing = GlibcBacking;
        unsafe {
            for align in [16usize, 64, 4096] {
                let p = backing.allocate(40, align);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                backing.release(p);
            }
        }
    }

    #[test]
    fn internal_allocator_round_trips() {
        let alloc = InternalAllocator;
        unsafe {
            let layout = Layout::from_size_align(24, 8).unwrap();
            let p = alloc.alloc_zeroed(layout);
            assert!(!p.is_null());
            assert!(std::slice::from_raw_parts(p, 24).iter().all(|&b| b == 0));
            let p = alloc.realloc(p, layout, 4096);
            assert!(!p.is_null());
            alloc.dealloc(p, Layout::from_size_align(4096, 8).unwrap());

            let big = Layout::from_size_align(8, 256).unwrap();
            let q = alloc.alloc(big);
            assert_eq!(q as usize % 256, 0);
            alloc.dealloc(q, big);
        }
    }
}
