//! Process-wide shim state and lazy initialization.
//!
//! UNINIT -> INITIALIZING -> READY. Bootstrap mode is active exactly while the
//! initializer runs, so every allocation made by the loader, `dlsym` or the
//! configuration reader during that window is served from the bootstrap arena.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use leakshim_core::bootstrap::BootstrapAllocator;
use leakshim_core::capability;
use leakshim_core::config;
use leakshim_core::diag;
use leakshim_core::diag_report;
use leakshim_core::engine::{CountingEngine, EngineStats, LeakEngine};
use leakshim_core::reentrancy::ReentrancyGuard;

use crate::backing::GlibcBacking;
use crate::interpose;

/// Live-allocation table capacity of the process engine.
pub const TABLE_CAPACITY: usize = 1 << 16;

pub type ShimEngine = CountingEngine<GlibcBacking, TABLE_CAPACITY>;

static ENGINE: ShimEngine = CountingEngine::new(GlibcBacking);
static BOOTSTRAP: BootstrapAllocator = BootstrapAllocator::new();

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static INIT_THREAD: AtomicU64 = AtomicU64::new(0);

#[inline]
#[must_use]
pub fn engine() -> &'static ShimEngine {
    &ENGINE
}

#[inline]
#[must_use]
pub fn bootstrap() -> &'static BootstrapAllocator {
    &BOOTSTRAP
}

#[inline]
#[must_use]
pub fn is_ready() -> bool {
    STATE.load(Ordering::Acquire) == STATE_READY
}

/// OS-level id of the calling thread.
#[must_use]
pub fn current_os_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::gettid() as u64 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        // SAFETY: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as u64 }
    }
}

/// Run initialization once. A call made by the initializing thread itself returns
/// immediately; other threads wait for it to finish.
pub fn ensure_initialized() {
    let state = STATE.load(Ordering::Acquire);
    if state == STATE_READY {
        return;
    }
    let me = current_os_thread_id();
    if state == STATE_UNINIT
        && STATE
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    {
        INIT_THREAD.store(me, Ordering::Release);
        initialize();
        STATE.store(STATE_READY, Ordering::Release);
        return;
    }
    if INIT_THREAD.load(Ordering::Acquire) == me {
        return;
    }
    while STATE.load(Ordering::Acquire) != STATE_READY {
        std::thread::yield_now();
    }
}

fn initialize() {
    let _bootstrap = BOOTSTRAP.enter_bootstrap_mode();
    let _guard = ReentrancyGuard::enter();

    config::resolve();
    if let Err(err) = interpose::resolve_all() {
        diag::die(&err);
    }
    #[cfg(not(debug_assertions))]
    if let Err(err) = interpose::verify_overrides() {
        diag::die(&err);
    }
    if let Some(real_exit) = interpose::real__exit() {
        diag::install_terminator(real_exit);
    }

    ENGINE.lazy_initialize(current_os_thread_id());

    #[cfg(not(any(target_os = "netbsd", target_os = "freebsd")))]
    if let Err(err) = crate::pthread_abi::create_finalize_key() {
        diag::die(&err);
    }

    if config::leak_check_at_exit()
        && let Err(err) = crate::process_abi::register_leak_check_at_exit()
    {
        diag::die(&err);
    }

    diag_report!(
        level = 1,
        "leakshim: initialized (exitcode={}, malloc_context_size={}, {} interceptors)",
        config::exitcode(),
        config::malloc_context_size(),
        capability::INTERCEPTS.len()
    );
    if config::verbosity() >= 2 {
        for row in capability::INTERCEPTS {
            diag_report!(
                "leakshim:   {:<40} {:?}/{:?}/{:?}",
                row.symbol,
                row.family,
                row.routing,
                row.on_failure
            );
        }
    }
}

/// Engine counters, for tests and diagnostics.
#[must_use]
pub fn engine_stats() -> EngineStats {
    ENGINE.stats()
}

/// Whether the process engine has already reported leaks.
#[must_use]
pub fn has_reported_leaks() -> bool {
    ENGINE.has_reported_leaks()
}

// Initialize from the loader rather than on the first allocation, so the main
// thread is the one registered as the main thread.
#[cfg(not(debug_assertions))]
#[used]
#[unsafe(link_section = ".init_array")]
static EAGER_INIT: extern "C" fn() = eager_init;

#[cfg(not(debug_assertions))]
extern "C" fn eager_init() {
    ensure_initialized();
}
