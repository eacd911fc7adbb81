//! glibc malloc-debugging entry points that make no sense under the shim's
//! allocator. They answer as if the feature were inert.

use std::ffi::{c_int, c_void};

/// `struct mallinfo` with every field zero.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mallinfo {
    pub fields: [c_int; 10],
}

pub type MallocCheckAbort = unsafe extern "C" fn(c_int);

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mallinfo() -> Mallinfo {
    Mallinfo::default()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mallopt(_param: c_int, _value: c_int) -> c_int {
    0
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcheck(_abort: Option<MallocCheckAbort>) -> c_int {
    0
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcheck_pedantic(_abort: Option<MallocCheckAbort>) -> c_int {
    0
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mprobe(_ptr: *mut c_void) -> c_int {
    0
}
