//! Real-symbol resolution.
//!
//! Each intercepted function that forwards keeps a [`RealSymbol`]: the address of
//! the next definition after this library in lookup order, found with
//! `dlsym(RTLD_NEXT, ..)` on first use and cached.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use leakshim_core::error::ShimError;
use leakshim_core::lifecycle::StartRoutine;
use leakshim_core::reentrancy::ReentrancyGuard;

pub struct RealSymbol {
    name: &'static CStr,
    addr: AtomicUsize,
}

impl RealSymbol {
    #[must_use]
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            addr: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }

    /// Cached address, resolving it on first call. `None` if nothing follows
    /// this library in lookup order.
    pub fn address(&self) -> Option<usize> {
        let cached = self.addr.load(Ordering::Acquire);
        if cached != 0 {
            return Some(cached);
        }
        // dlsym may allocate (dlerror buffers); keep that out of the leak report.
        let _guard = ReentrancyGuard::enter();
        // SAFETY: `name` is NUL-terminated and lives forever.
        let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) };
        if ptr.is_null() {
            return None;
        }
        self.addr.store(ptr as usize, Ordering::Release);
        Some(ptr as usize)
    }

    /// Bind `new_impl` over this symbol and return the real implementation.
    ///
    /// On Linux the binding itself is done by the dynamic loader (this library's
    /// export wins over the ones after it); this checks the result is usable.
    pub fn register_override(&self, new_impl: usize) -> Result<usize, ShimError> {
        let real = self
            .address()
            .ok_or(ShimError::SymbolUnresolved(self.name()))?;
        if real == new_impl {
            return Err(ShimError::SelfResolved(self.name()));
        }
        Ok(real)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.addr.load(Ordering::Acquire) != 0
    }
}

pub type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> c_int;
pub type PthreadJoinFn = unsafe extern "C" fn(libc::pthread_t, *mut *mut c_void) -> c_int;
pub type ExitFn = unsafe extern "C" fn(c_int) -> !;
pub type AtexitCallback = unsafe extern "C" fn(*mut c_void);
pub type CxaAtexitFn =
    unsafe extern "C" fn(Option<AtexitCallback>, *mut c_void, *mut c_void) -> c_int;
pub type ForkHook = unsafe extern "C" fn();
pub type PthreadAtforkFn =
    unsafe extern "C" fn(Option<ForkHook>, Option<ForkHook>, Option<ForkHook>) -> c_int;
/// glibc's `__register_atfork(prepare, parent, child, dso_handle)`.
pub type RegisterAtforkFn = unsafe extern "C" fn(
    Option<ForkHook>,
    Option<ForkHook>,
    Option<ForkHook>,
    *mut c_void,
) -> c_int;
pub type StrerrorFn = unsafe extern "C" fn(c_int) -> *mut c_char;
pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
pub type HookFn = unsafe extern "C" fn();
pub type LibcStartMainFn = unsafe extern "C" fn(
    Option<MainFn>,
    c_int,
    *mut *mut c_char,
    Option<HookFn>,
    Option<HookFn>,
    Option<HookFn>,
    *mut c_void,
) -> c_int;
pub type MallocUsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

macro_rules! real_symbols {
    ($( $accessor:ident => $slot:ident = $symbol:literal : $ty:ty; )*) => {
        $(
            pub static $slot: RealSymbol = RealSymbol::new($symbol);

            #[must_use]
            pub fn $accessor() -> Option<$ty> {
                let addr = $slot.address()?;
                // SAFETY: `addr` is the libc definition of this symbol, whose C
                // signature is `$ty`.
                Some(unsafe { std::mem::transmute::<usize, $ty>(addr) })
            }
        )*

        /// Every forwarded symbol.
        pub static REAL_SYMBOLS: &[&RealSymbol] = &[$(&$slot),*];
    };
}

real_symbols! {
    real_pthread_create => REAL_PTHREAD_CREATE = c"pthread_create": PthreadCreateFn;
    real_pthread_join => REAL_PTHREAD_JOIN = c"pthread_join": PthreadJoinFn;
    real_exit => REAL_EXIT = c"exit": ExitFn;
    real__exit => REAL__EXIT = c"_exit": ExitFn;
    real___cxa_atexit => REAL___CXA_ATEXIT = c"__cxa_atexit": CxaAtexitFn;
    real_pthread_atfork => REAL_PTHREAD_ATFORK = c"pthread_atfork": PthreadAtforkFn;
    real___register_atfork => REAL___REGISTER_ATFORK = c"__register_atfork": RegisterAtforkFn;
    real_strerror => REAL_STRERROR = c"strerror": StrerrorFn;
    real___libc_start_main => REAL___LIBC_START_MAIN = c"__libc_start_main": LibcStartMainFn;
    real_malloc_usable_size => REAL_MALLOC_USABLE_SIZE = c"malloc_usable_size": MallocUsableSizeFn;
}

/// Symbols the shim cannot run without.
pub static REQUIRED_SYMBOLS: &[&RealSymbol] = &[
    &REAL_PTHREAD_CREATE,
    &REAL_PTHREAD_JOIN,
    &REAL_EXIT,
    &REAL__EXIT,
    &REAL___CXA_ATEXIT,
];

/// Resolve every forwarded symbol up front. Fails on the first missing required
/// symbol; the others are only looked up again when first called.
pub fn resolve_all() -> Result<(), ShimError> {
    for symbol in REAL_SYMBOLS {
        if symbol.address().is_none() && REQUIRED_SYMBOLS.iter().any(|r| std::ptr::eq(*r, *symbol)) {
            return Err(ShimError::SymbolUnresolved(symbol.name()));
        }
    }
    Ok(())
}

/// Check that the exported interceptors did not resolve to themselves.
#[cfg(not(debug_assertions))]
pub fn verify_overrides() -> Result<(), ShimError> {
    REAL_PTHREAD_CREATE.register_override(crate::pthread_abi::pthread_create as usize)?;
    REAL_PTHREAD_JOIN.register_override(crate::pthread_abi::pthread_join as usize)?;
    REAL__EXIT.register_override(crate::process_abi::_exit as usize)?;
    REAL_EXIT.register_override(crate::process_abi::exit as usize)?;
    REAL___CXA_ATEXIT.register_override(crate::process_abi::__cxa_atexit as usize)?;
    REAL_STRERROR.register_override(crate::process_abi::strerror as usize)?;
    Ok(())
}
