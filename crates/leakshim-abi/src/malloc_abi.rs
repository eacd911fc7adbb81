//! C allocator interceptors: `malloc`, `free`, `calloc`, `realloc` and the aligned
//! family.
//!
//! Routing per call:
//! 1. While bootstrap mode is active, fresh allocations come from the bootstrap
//!    arena; pointers the arena owns always go back to it, and engine pointers
//!    always go back to the engine.
//! 2. Otherwise the shim is initialized if needed and the request goes to the
//!    engine, with a call-site captured under the reentrancy guard. A thread that
//!    already holds the guard gets an untraced allocation marked ignored.

use std::ffi::{c_int, c_void};

use leakshim_core::callsite::CallSite;
use leakshim_core::config;
use leakshim_core::diag_report;
use leakshim_core::engine::{AllocRequest, LeakEngine};
use leakshim_core::error::ShimError;
use leakshim_core::reentrancy::ReentrancyGuard;

use crate::runtime_state;
use crate::set_abi_errno;

/// Run `f` with the caller's call-site, skipping this frame plus `helpers` more
/// (never-inlined glue between the interceptor and here).
#[inline(never)]
pub(crate) fn with_call_site<R>(helpers: usize, f: impl FnOnce(&CallSite, bool) -> R) -> R {
    runtime_state::ensure_initialized();
    match ReentrancyGuard::try_enter() {
        Some(_guard) => {
            let site = CallSite::capture(1 + helpers, config::malloc_context_size());
            f(&site, false)
        }
        None => f(&CallSite::empty(), true),
    }
}

#[inline(never)]
pub(crate) fn engine_allocate(request: AllocRequest) -> *mut c_void {
    with_call_site(1, |site, ignored| {
        // SAFETY: the block is handed to the C caller, who owns it until free.
        unsafe {
            runtime_state::engine().track_allocate(request.ignored(request.ignored || ignored), site)
        }
    })
}

fn bootstrap_allocate(size: usize) -> *mut c_void {
    let ptr = runtime_state::bootstrap().allocate(size, runtime_state::engine());
    if ptr.is_null() {
        diag_report!(level = 1, "leakshim: {}", ShimError::BootstrapExhausted { size });
        // SAFETY: writes TLS errno.
        unsafe { set_abi_errno(libc::ENOMEM) };
    }
    ptr
}

/// Release any pointer handed out by the shim.
pub(crate) unsafe fn release(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let bootstrap = runtime_state::bootstrap();
    if bootstrap.owns(ptr) {
        bootstrap.free(ptr, runtime_state::engine());
        return;
    }
    runtime_state::ensure_initialized();
    // SAFETY: not a bootstrap block, so it came from the engine.
    unsafe { runtime_state::engine().track_free(ptr) };
}

#[inline(never)]
unsafe fn reallocate(ptr: *mut c_void, size: usize) -> *mut c_void {
    let bootstrap = runtime_state::bootstrap();
    // Engine blocks stay with the engine even while bootstrap mode is on.
    if bootstrap.owns(ptr) || (ptr.is_null() && bootstrap.in_use()) {
        let out = bootstrap.reallocate(ptr, size, runtime_state::engine());
        if out.is_null() && size != 0 {
            // SAFETY: writes TLS errno.
            unsafe { set_abi_errno(libc::ENOMEM) };
        }
        return out;
    }
    with_call_site(1, |site, ignored| {
        // SAFETY: `ptr` is null or a live engine block.
        unsafe { runtime_state::engine().track_reallocate(ptr, size, site, ignored) }
    })
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 { page as usize } else { 4096 }
}

fn null_with_errno(errno: c_int) -> *mut c_void {
    // SAFETY: writes TLS errno.
    unsafe { set_abi_errno(errno) };
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// malloc / free
// ---------------------------------------------------------------------------

/// POSIX `malloc`. A zero-byte request returns a unique non-null block.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    if runtime_state::bootstrap().in_use() {
        return bootstrap_allocate(size);
    }
    engine_allocate(AllocRequest::new(size))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // SAFETY: C contract of free.
    unsafe { release(ptr) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    // SAFETY: C contract of free.
    unsafe { release(ptr) }
}

// ---------------------------------------------------------------------------
// calloc / realloc
// ---------------------------------------------------------------------------

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return null_with_errno(libc::ENOMEM);
    };
    let bootstrap = runtime_state::bootstrap();
    if bootstrap.in_use() {
        let ptr = bootstrap.allocate_zeroed(nmemb, size, runtime_state::engine());
        if ptr.is_null() {
            diag_report!(level = 1, "leakshim: {}", ShimError::BootstrapExhausted { size: total });
            return null_with_errno(libc::ENOMEM);
        }
        return ptr;
    }
    engine_allocate(AllocRequest::new(total).zeroed())
}

/// POSIX `realloc`. `realloc(NULL, n)` allocates; `realloc(p, 0)` frees `p` and
/// returns null.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: C contract of realloc.
    unsafe { reallocate(ptr, size) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn reallocarray(ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return null_with_errno(libc::ENOMEM);
    };
    // SAFETY: C contract of realloc.
    unsafe { reallocate(ptr, total) }
}

// ---------------------------------------------------------------------------
// Aligned family
// ---------------------------------------------------------------------------

fn aligned(size: usize, alignment: usize) -> *mut c_void {
    engine_allocate(AllocRequest::aligned(size, alignment))
}

/// POSIX `posix_memalign`. Returns the error code; `errno` is left alone.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % std::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    let ptr = aligned(size, alignment);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    if !memptr.is_null() {
        // SAFETY: caller provides a writable out-pointer.
        unsafe { *memptr = ptr };
    }
    0
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        return null_with_errno(libc::EINVAL);
    }
    aligned(size, alignment)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __libc_memalign(alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: same contract as memalign.
    unsafe { memalign(alignment, size) }
}

/// C11 `aligned_alloc`: `size` must be a multiple of a power-of-two `alignment`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() || size % alignment != 0 {
        return null_with_errno(libc::EINVAL);
    }
    aligned(size, alignment)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    aligned(size, page_size())
}

/// `pvalloc`: page-aligned, size rounded up to whole pages (0 becomes one page).
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page = page_size();
    let rounded = if size == 0 {
        page
    } else {
        match size.checked_add(page - 1) {
            Some(n) => n & !(page - 1),
            None => return null_with_errno(libc::ENOMEM),
        }
    };
    aligned(rounded, page)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let bootstrap = runtime_state::bootstrap();
    if bootstrap.owns(ptr) {
        return bootstrap.usable_size(ptr);
    }
    runtime_state::ensure_initialized();
    runtime_state::engine().usable_size(ptr)
}
