//! Reference engine: liveness-based leak accounting.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::callsite::{self, CallSite};
use crate::config;
use crate::diag::StderrSink;
use crate::engine::report::{self, LeakSummary};
use crate::engine::scan::{self, Reachability};
use crate::engine::{
    AllocRequest, AllocationTable, Backing, LeakEngine, LiveAllocation, MIN_ALIGNMENT, RootRegion,
    RootRegionTable, RootRegistry, ThreadId, ThreadRegistry,
};
use crate::reentrancy::{ReentrancyGuard, ThreadContext};

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub untracked_allocations: usize,
    pub root_regions: usize,
    pub threads_created: usize,
    pub threads_finished: usize,
}

/// Engine that reports live allocations no root reaches as leaks.
///
/// `N` is the capacity of the live-allocation table (a power of two).
pub struct CountingEngine<B: Backing, const N: usize> {
    backing: B,
    table: AllocationTable<N>,
    roots: RootRegionTable,
    threads: ThreadRegistry,
    initialized: AtomicBool,
    leaks_reported: AtomicBool,
}

impl<B: Backing, const N: usize> CountingEngine<B, N> {
    #[must_use]
    pub const fn new(backing: B) -> Self {
        Self::with_threads(backing, ThreadRegistry::new())
    }

    #[must_use]
    pub const fn with_threads(backing: B, threads: ThreadRegistry) -> Self {
        Self {
            backing,
            table: AllocationTable::new(),
            roots: RootRegionTable::new(),
            threads,
            initialized: AtomicBool::new(false),
            leaks_reported: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            live_allocations: self.table.live_count(),
            live_bytes: self.table.live_bytes(),
            untracked_allocations: self.table.overflowed(),
            root_regions: self.roots.count(),
            threads_created: self.threads.created_count(),
            threads_finished: self.threads.finished_count(),
        }
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    #[must_use]
    pub fn roots(&self) -> &RootRegionTable {
        &self.roots
    }

    #[must_use]
    pub fn lookup(&self, ptr: *const c_void) -> Option<LiveAllocation> {
        self.table.get(ptr as usize)
    }

    /// Gather the current leaks without printing or latching anything.
    #[must_use]
    pub fn collect_leaks(&self) -> LeakSummary {
        let mut live = Vec::with_capacity(self.table.live_count());
        self.table.for_each_live(|entry| live.push(entry));
        let reach = self.mark_reachable(&live);
        LeakSummary::from_allocations(live.into_iter().filter(|a| !reach.is_marked(a.addr)))
    }

    /// Conservative mark pass. Roots are ignored blocks, registered root regions
    /// and (when enabled) writable data segments, minus this engine's own storage.
    fn mark_reachable(&self, live: &[LiveAllocation]) -> Reachability {
        let mut reach = Reachability::new(live);
        for entry in live.iter().filter(|a| a.ignored) {
            reach.mark_value(entry.addr);
        }
        let mut regions = Vec::with_capacity(self.roots.count());
        self.roots.for_each(|region| regions.push(region));
        for region in regions {
            // SAFETY: registrants promise the region stays readable while registered.
            unsafe { reach.scan_range(region.base, region.base.saturating_add(region.size)) };
        }
        if config::use_globals() {
            let own_start = self as *const Self as usize;
            let own_end = own_start + std::mem::size_of::<Self>();
            for (start, end) in scan::global_data_ranges() {
                for (lo, hi) in [(start, end.min(own_start)), (start.max(own_end), end)] {
                    if lo < hi {
                        // SAFETY: loaded writable segments are mapped for their memsz.
                        unsafe { reach.scan_range(lo, hi) };
                    }
                }
            }
        }
        // SAFETY: the caller holds the reentrancy guard; `live` was just snapshotted.
        unsafe { reach.propagate() };
        reach
    }

    fn publish_report(&self, summary: &LeakSummary) {
        let pid = std::process::id();
        let _ = report::render_text(
            summary,
            pid,
            config::max_leaks(),
            &mut StderrSink,
            callsite::symbolize,
        );
        if let Some(path) = config::log_path() {
            let entries = report::log_entries(summary, pid, self.configured_leak_exit_code());
            if let Err(err) = report::write_jsonl(path, &entries) {
                crate::diag_report!("WARNING: leakshim: cannot write report to {}: {err}", path.display());
            }
        }
    }
}

impl<B: Backing, const N: usize> RootRegistry for CountingEngine<B, N> {
    fn register_root_region(&self, base: *const c_void, size: usize) {
        let region = RootRegion {
            base: base as usize,
            size,
        };
        if !self.roots.register(region) {
            crate::diag_report!(level = 1, "leakshim: root region table full, {size} bytes at {base:p} untracked");
        }
    }

    fn unregister_root_region(&self, base: *const c_void, size: usize) {
        self.roots.unregister(RootRegion {
            base: base as usize,
            size,
        });
    }
}

impl<B: Backing, const N: usize> LeakEngine for CountingEngine<B, N> {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn lazy_initialize(&self, main_os_id: u64) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.threads.register_main(main_os_id);
        self.initialized.store(true, Ordering::Release);
    }

    unsafe fn track_allocate(&self, request: AllocRequest, trace: &CallSite) -> *mut c_void {
        let size = request.size.max(1);
        let align = request.align.max(MIN_ALIGNMENT);
        // SAFETY: `align` is a power of two no smaller than the pointer size.
        let ptr = unsafe { self.backing.allocate(size, align) };
        if ptr.is_null() {
            return ptr;
        }
        if request.zeroed {
            // SAFETY: the backing returned at least `size` writable bytes.
            unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, size) };
        }
        let owner = ThreadContext::current_thread();
        self.table
            .insert(ptr as usize, request.size, owner, request.ignored, trace);
        ptr
    }

    unsafe fn track_free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        self.table.remove(ptr as usize);
        // SAFETY: caller guarantees `ptr` came from this engine's backing.
        unsafe { self.backing.release(ptr) };
    }

    unsafe fn track_reallocate(
        &self,
        ptr: *mut c_void,
        size: usize,
        trace: &CallSite,
        ignored: bool,
    ) -> *mut c_void {
        if ptr.is_null() {
            // SAFETY: plain allocation.
            return unsafe { self.track_allocate(AllocRequest::new(size).ignored(ignored), trace) };
        }
        if size == 0 {
            // SAFETY: caller guarantees `ptr` is live in this engine.
            unsafe { self.track_free(ptr) };
            return std::ptr::null_mut();
        }
        let old_size = match self.table.size_of(ptr as usize) {
            Some(n) => n,
            // SAFETY: untracked (table overflow) blocks still come from the backing.
            None => unsafe { self.backing.usable_size(ptr) },
        };
        // SAFETY: plain allocation.
        let new = unsafe { self.track_allocate(AllocRequest::new(size).ignored(ignored), trace) };
        if new.is_null() {
            // The old block stays valid on failure.
            return new;
        }
        // SAFETY: both blocks are live and at least min(old, new) bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), old_size.min(size));
            self.track_free(ptr);
        }
        new
    }

    fn usable_size(&self, ptr: *const c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        self.table.size_of(ptr as usize).unwrap_or(0)
    }

    fn thread_create(&self, parent: ThreadId, detached: bool) -> ThreadId {
        self.threads.create(parent, detached)
    }

    fn thread_start(&self, id: ThreadId, os_id: u64) {
        if !self.threads.start(id, os_id) {
            crate::diag_report!(level = 1, "leakshim: start of unregistered thread {id}");
        }
    }

    fn thread_finish(&self, id: ThreadId) {
        self.threads.finish(id);
    }

    fn do_leak_check(&self) -> LeakSummary {
        let _guard = ReentrancyGuard::enter();
        let summary = self.collect_leaks();
        if summary.has_leaks() {
            self.leaks_reported.store(true, Ordering::Release);
        }
        self.publish_report(&summary);
        if self.table.overflowed() > 0 {
            crate::diag_report!(
                level = 1,
                "leakshim: {} allocation(s) were not tracked (table full)",
                self.table.overflowed()
            );
        }
        summary
    }

    fn has_reported_leaks(&self) -> bool {
        self.leaks_reported.load(Ordering::Acquire)
    }

    fn configured_leak_exit_code(&self) -> i32 {
        config::exitcode()
    }
}
