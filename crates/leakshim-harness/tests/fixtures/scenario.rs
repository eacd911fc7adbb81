//! C-style program for preload scenarios. Runs without the Rust runtime so every
//! allocation it makes comes from the scenario itself or from libc.
//!
//! Usage: `leakshim-scenario <leak|clean|threads|exit-leak>`

#![no_main]
#![allow(unsafe_code)]

use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr;

const THREADS: usize = 10;

unsafe fn leak(size: usize) {
    let p = unsafe { libc::malloc(size) };
    if !p.is_null() {
        unsafe { ptr::write_bytes(p.cast::<u8>(), 0xa5, size) };
    }
}

extern "C" fn worker(_arg: *mut c_void) -> *mut c_void {
    unsafe {
        let p = libc::malloc(48);
        libc::free(p);
    }
    ptr::null_mut()
}

unsafe fn run_threads() -> c_int {
    let mut handles = [0 as libc::pthread_t; THREADS];
    for handle in &mut handles {
        let rc = unsafe { libc::pthread_create(handle, ptr::null(), worker, ptr::null_mut()) };
        if rc != 0 {
            return 2;
        }
    }
    for handle in handles {
        if unsafe { libc::pthread_join(handle, ptr::null_mut()) } != 0 {
            return 3;
        }
    }
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn main(argc: c_int, argv: *const *const c_char) -> c_int {
    if argc < 2 {
        return 64;
    }
    let scenario = unsafe { CStr::from_ptr(*argv.add(1)) }.to_bytes();
    unsafe {
        match scenario {
            b"leak" => {
                leak(64);
                0
            }
            b"clean" => {
                let p = libc::malloc(128);
                libc::free(p);
                // stdio keeps its buffer reachable from libc's data segment.
                libc::puts(c"clean".as_ptr());
                0
            }
            b"threads" => run_threads(),
            b"exit-leak" => {
                leak(32);
                libc::exit(5)
            }
            _ => 64,
        }
    }
}
