//! Registered root regions.
//!
//! Bootstrap allocations are registered here while they are live. The table is a
//! flat array of CAS-claimed slots: registration happens during initialization on
//! the allocation path, so it must not allocate or lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::RootRegion;

pub const ROOT_REGION_CAPACITY: usize = 1024;

const BASE_FREE: usize = 0;
// Claimed but size not yet written.
const SIZE_PENDING: usize = usize::MAX;

pub struct RootRegionTable {
    bases: [AtomicUsize; ROOT_REGION_CAPACITY],
    sizes: [AtomicUsize; ROOT_REGION_CAPACITY],
    dropped: AtomicUsize,
}

impl RootRegionTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bases: [const { AtomicUsize::new(BASE_FREE) }; ROOT_REGION_CAPACITY],
            sizes: [const { AtomicUsize::new(SIZE_PENDING) }; ROOT_REGION_CAPACITY],
            dropped: AtomicUsize::new(0),
        }
    }

    /// Returns `false` when the table is full; the region is then not tracked.
    pub fn register(&self, region: RootRegion) -> bool {
        if region.base == BASE_FREE {
            return false;
        }
        for (base, size) in self.bases.iter().zip(&self.sizes) {
            if base
                .compare_exchange(BASE_FREE, region.base, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                size.store(region.size, Ordering::Release);
                return true;
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Remove an exact `(base, size)` registration.
    pub fn unregister(&self, region: RootRegion) -> bool {
        for (base, size) in self.bases.iter().zip(&self.sizes) {
            if base.load(Ordering::Acquire) != region.base
                || size.load(Ordering::Acquire) != region.size
            {
                continue;
            }
            size.store(SIZE_PENDING, Ordering::Relaxed);
            base.store(BASE_FREE, Ordering::Release);
            return true;
        }
        false
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let mut hit = false;
        self.for_each(|region| hit |= region.contains(addr));
        hit
    }

    pub fn for_each(&self, mut f: impl FnMut(RootRegion)) {
        for (base, size) in self.bases.iter().zip(&self.sizes) {
            let b = base.load(Ordering::Acquire);
            let s = size.load(Ordering::Acquire);
            if b != BASE_FREE && s != SIZE_PENDING {
                f(RootRegion { base: b, size: s });
            }
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }

    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for RootRegionTable {
    fn default() -> Self {
        Self::new()
    }
}
