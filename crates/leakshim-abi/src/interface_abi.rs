//! Public C interface for programs that know they run under the shim.

use std::ffi::{c_int, c_void};

use leakshim_core::engine::{LeakEngine, RootRegistry};

use crate::runtime_state;

/// Run a leak check now and print the report. Returns 1 if leaks were found.
///
/// Later checks (including the one at exit) still run; a positive result
/// here already makes a successful exit fail with the leak exit code.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn leakshim_do_leak_check() -> c_int {
    runtime_state::ensure_initialized();
    c_int::from(runtime_state::engine().do_leak_check().has_leaks())
}

/// Add `[base, base + size)` to the engine's root regions.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn leakshim_register_root_region(base: *const c_void, size: usize) {
    runtime_state::ensure_initialized();
    runtime_state::engine().register_root_region(base, size);
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn leakshim_unregister_root_region(base: *const c_void, size: usize) {
    runtime_state::ensure_initialized();
    runtime_state::engine().unregister_root_region(base, size);
}
