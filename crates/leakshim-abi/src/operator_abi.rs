//! C++ `operator new` / `operator delete` interceptors (Itanium ABI, 64-bit).
//!
//! Throwing variants turn a failed allocation into a fatal out-of-memory report;
//! `nothrow` variants return null. Every delete variant frees through the same
//! path as `free`; the size and alignment hints are not needed to release a block.

#![allow(non_snake_case)]

use std::ffi::c_void;

use leakshim_core::callsite::{CallSite, MAX_TRACE_DEPTH};
use leakshim_core::diag;
use leakshim_core::engine::AllocRequest;
use leakshim_core::error::ShimError;

use crate::malloc_abi;

/// Opaque `const std::nothrow_t&`.
pub type NothrowTag = *const c_void;

#[cold]
#[inline(never)]
fn report_oom(size: usize) -> ! {
    let site = CallSite::capture(1, MAX_TRACE_DEPTH);
    diag::die_at(&ShimError::OutOfMemory { size }, site.frames())
}

macro_rules! operator_new {
    (@on_null FatalOom, $ptr:ident, $size:ident) => {
        if $ptr.is_null() {
            report_oom($size);
        }
    };
    (@on_null ReturnNull, $ptr:ident, $size:ident) => {};
    ($(
        $(#[$meta:meta])*
        $name:ident ( $($arg:ident : $argty:ty),* ) => $policy:ident, align = $align:expr;
    )*) => {
        $(
            $(#[$meta])*
            #[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
            pub unsafe extern "C" fn $name(size: usize $(, $arg: $argty)*) -> *mut c_void {
                $( let _ = &$arg; )*
                let ptr = malloc_abi::engine_allocate(AllocRequest::aligned(size, $align));
                operator_new!(@on_null $policy, ptr, size);
                ptr
            }
        )*
    };
}

macro_rules! operator_delete {
    ($(
        $(#[$meta:meta])*
        $name:ident ( $($arg:ident : $argty:ty),* );
    )*) => {
        $(
            $(#[$meta])*
            #[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
            pub unsafe extern "C" fn $name(ptr: *mut c_void $(, $arg: $argty)*) {
                $( let _ = $arg; )*
                // SAFETY: C++ contract of operator delete.
                unsafe { malloc_abi::release(ptr) }
            }
        )*
    };
}

operator_new! {
    /// `operator new(size_t)`
    _Znwm() => FatalOom, align = 0;
    /// `operator new[](size_t)`
    _Znam() => FatalOom, align = 0;
    /// `operator new(size_t, const std::nothrow_t&)`
    _ZnwmRKSt9nothrow_t(nothrow: NothrowTag) => ReturnNull, align = 0;
    /// `operator new[](size_t, const std::nothrow_t&)`
    _ZnamRKSt9nothrow_t(nothrow: NothrowTag) => ReturnNull, align = 0;
    /// `operator new(size_t, std::align_val_t)`
    _ZnwmSt11align_val_t(align: usize) => FatalOom, align = align;
    /// `operator new[](size_t, std::align_val_t)`
    _ZnamSt11align_val_t(align: usize) => FatalOom, align = align;
    /// `operator new(size_t, std::align_val_t, const std::nothrow_t&)`
    _ZnwmSt11align_val_tRKSt9nothrow_t(align: usize, nothrow: NothrowTag) => ReturnNull, align = align;
    /// `operator new[](size_t, std::align_val_t, const std::nothrow_t&)`
    _ZnamSt11align_val_tRKSt9nothrow_t(align: usize, nothrow: NothrowTag) => ReturnNull, align = align;
}

operator_delete! {
    /// `operator delete(void*)`
    _ZdlPv();
    /// `operator delete[](void*)`
    _ZdaPv();
    /// `operator delete(void*, const std::nothrow_t&)`
    _ZdlPvRKSt9nothrow_t(nothrow: NothrowTag);
    /// `operator delete[](void*, const std::nothrow_t&)`
    _ZdaPvRKSt9nothrow_t(nothrow: NothrowTag);
    /// `operator delete(void*, size_t)`
    _ZdlPvm(size: usize);
    /// `operator delete[](void*, size_t)`
    _ZdaPvm(size: usize);
    /// `operator delete(void*, std::align_val_t)`
    _ZdlPvSt11align_val_t(align: usize);
    /// `operator delete[](void*, std::align_val_t)`
    _ZdaPvSt11align_val_t(align: usize);
    /// `operator delete(void*, std::align_val_t, const std::nothrow_t&)`
    _ZdlPvSt11align_val_tRKSt9nothrow_t(align: usize, nothrow: NothrowTag);
    /// `operator delete[](void*, std::align_val_t, const std::nothrow_t&)`
    _ZdaPvSt11align_val_tRKSt9nothrow_t(align: usize, nothrow: NothrowTag);
    /// `operator delete(void*, size_t, std::align_val_t)`
    _ZdlPvmSt11align_val_t(size: usize, align: usize);
    /// `operator delete[](void*, size_t, std::align_val_t)`
    _ZdaPvmSt11align_val_t(size: usize, align: usize);
}
