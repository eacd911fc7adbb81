//! Live-allocation table.
//!
//! A fixed-capacity open-addressed table keyed by block address. Every operation is
//! allocation-free and lock-free, so the table can be updated from inside `malloc`
//! and `free` on any thread:
//!
//! - **insert** claims the first empty or tombstoned slot on the probe path with a
//!   CAS on the key, fills the metadata, then publishes it.
//! - **remove** unpublishes the metadata and leaves a tombstone so later probes
//!   continue past the slot.
//! - **lookup** stops at the first never-used slot.
//!
//! When the table is full an allocation is simply not tracked; the overflow counter
//! records how often that happened.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::callsite::{CallSite, MAX_TRACE_DEPTH};
use crate::engine::ThreadId;

const KEY_EMPTY: usize = 0;
const KEY_TOMBSTONE: usize = 1;

const META_DEPTH_SHIFT: u32 = 32;
const META_IGNORED: u64 = 1 << 40;
const META_PUBLISHED: u64 = 1 << 41;

struct Slot {
    key: AtomicUsize,
    size: AtomicUsize,
    /// owner (bits 0..32) | depth (32..40) | ignored | published
    meta: AtomicU64,
    frames: [AtomicUsize; MAX_TRACE_DEPTH],
}

impl Slot {
    const fn new() -> Self {
        Self {
            key: AtomicUsize::new(KEY_EMPTY),
            size: AtomicUsize::new(0),
            meta: AtomicU64::new(0),
            frames: [const { AtomicUsize::new(0) }; MAX_TRACE_DEPTH],
        }
    }

    fn fill(&self, size: usize, owner: ThreadId, ignored: bool, trace: &CallSite) {
        let frames = trace.frames();
        for (dst, &ip) in self.frames.iter().zip(frames) {
            dst.store(ip, Ordering::Relaxed);
        }
        self.size.store(size, Ordering::Relaxed);
        let mut meta = u64::from(owner.get())
            | ((frames.len() as u64) << META_DEPTH_SHIFT)
            | META_PUBLISHED;
        if ignored {
            meta |= META_IGNORED;
        }
        self.meta.store(meta, Ordering::Release);
    }

    fn snapshot(&self, addr: usize) -> Option<LiveAllocation> {
        let meta = self.meta.load(Ordering::Acquire);
        if meta & META_PUBLISHED == 0 {
            return None;
        }
        let depth = ((meta >> META_DEPTH_SHIFT) & 0xff) as usize;
        let mut frames = [0usize; MAX_TRACE_DEPTH];
        for (dst, src) in frames.iter_mut().zip(&self.frames).take(depth) {
            *dst = src.load(Ordering::Relaxed);
        }
        Some(LiveAllocation {
            addr,
            size: self.size.load(Ordering::Relaxed),
            owner: ThreadId::new(meta as u32),
            ignored: meta & META_IGNORED != 0,
            trace: CallSite::from_frames(&frames[..depth]),
        })
    }
}

/// Snapshot of one tracked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAllocation {
    pub addr: usize,
    pub size: usize,
    pub owner: ThreadId,
    pub ignored: bool,
    pub trace: CallSite,
}

pub struct AllocationTable<const N: usize> {
    slots: [Slot; N],
    live: AtomicUsize,
    live_bytes: AtomicUsize,
    overflowed: AtomicUsize,
}

impl<const N: usize> AllocationTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        const { assert!(N.is_power_of_two(), "table capacity must be a power of two") };
        Self {
            slots: [const { Slot::new() }; N],
            live: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            overflowed: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    fn home(addr: usize) -> usize {
        // Blocks are at least 16-byte aligned; drop the always-zero bits.
        let h = ((addr >> 4) as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (h >> 32) as usize & (N - 1)
    }

    /// Record a live block. Returns `false` when the table is full.
    pub fn insert(
        &self,
        addr: usize,
        size: usize,
        owner: ThreadId,
        ignored: bool,
        trace: &CallSite,
    ) -> bool {
        debug_assert!(addr > KEY_TOMBSTONE);
        let start = Self::home(addr);
        for i in 0..N {
            let slot = &self.slots[(start + i) & (N - 1)];
            let current = slot.key.load(Ordering::Acquire);
            if current == KEY_EMPTY || current == KEY_TOMBSTONE {
                if slot
                    .key
                    .compare_exchange(current, addr, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.fill(size, owner, ignored, trace);
                    self.live.fetch_add(1, Ordering::Relaxed);
                    self.live_bytes.fetch_add(size, Ordering::Relaxed);
                    return true;
                }
                // Lost the race for this slot; keep probing.
                continue;
            }
            if current == addr {
                // Stale entry for a reused address; overwrite it.
                let old = slot.size.load(Ordering::Relaxed);
                slot.fill(size, owner, ignored, trace);
                self.live_bytes.fetch_add(size, Ordering::Relaxed);
                self.live_bytes.fetch_sub(old, Ordering::Relaxed);
                return true;
            }
        }
        self.overflowed.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn find(&self, addr: usize) -> Option<&Slot> {
        let start = Self::home(addr);
        for i in 0..N {
            let slot = &self.slots[(start + i) & (N - 1)];
            let current = slot.key.load(Ordering::Acquire);
            if current == addr {
                return Some(slot);
            }
            if current == KEY_EMPTY {
                return None;
            }
        }
        None
    }

    /// Forget a block, returning its recorded size.
    pub fn remove(&self, addr: usize) -> Option<usize> {
        let slot = self.find(addr)?;
        let size = slot.size.load(Ordering::Relaxed);
        slot.meta.store(0, Ordering::Release);
        if slot
            .key
            .compare_exchange(addr, KEY_TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Concurrent double free of the same block; the other remover won.
            return None;
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        Some(size)
    }

    #[must_use]
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.find(addr).map(|slot| slot.size.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(&self, addr: usize) -> Option<LiveAllocation> {
        self.find(addr).and_then(|slot| slot.snapshot(addr))
    }

    /// Visit every published live block.
    pub fn for_each_live(&self, mut f: impl FnMut(LiveAllocation)) {
        for slot in &self.slots {
            let key = slot.key.load(Ordering::Acquire);
            if key <= KEY_TOMBSTONE {
                continue;
            }
            if let Some(entry) = slot.snapshot(key) {
                f(entry);
            }
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn overflowed(&self) -> usize {
        self.overflowed.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for AllocationTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(ip: usize) -> CallSite {
        CallSite::from_frames(&[ip, ip + 1])
    }

    #[test]
    fn insert_lookup_remove() {
        let table = Box::new(AllocationTable::<64>::new());
        assert!(table.insert(0x1000, 32, ThreadId::MAIN, false, &site(0x40)));
        assert_eq!(table.size_of(0x1000), Some(32));
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.live_bytes(), 32);

        let entry = table.get(0x1000).unwrap();
        assert_eq!(entry.trace.frames(), &[0x40, 0x41]);
        assert!(!entry.ignored);

        assert_eq!(table.remove(0x1000), Some(32));
        assert_eq!(table.size_of(0x1000), None);
        assert_eq!(table.remove(0x1000), None);
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.live_bytes(), 0);
    }

    #[test]
    fn probes_past_tombstones() {
        let table = Box::new(AllocationTable::<8>::new());
        let addrs: Vec<usize> = (1..=6).map(|i| i * 0x10_0000).collect();
        for &a in &addrs {
            assert!(table.insert(a, 8, ThreadId::MAIN, false, &CallSite::empty()));
        }
        for &a in &addrs[..3] {
            assert_eq!(table.remove(a), Some(8));
        }
        for &a in &addrs[3..] {
            assert_eq!(table.size_of(a), Some(8), "lost {a:#x}");
        }
        // Tombstones are reusable.
        for i in 0..5 {
            assert!(table.insert(0x900_0000 + i * 0x100, 1, ThreadId::MAIN, false, &CallSite::empty()));
        }
        assert_eq!(table.live_count(), 8);
    }

    #[test]
    fn full_table_counts_overflow() {
        let table = Box::new(AllocationTable::<4>::new());
        for i in 1..=4 {
            assert!(table.insert(i * 0x100, 1, ThreadId::MAIN, false, &CallSite::empty()));
        }
        assert!(!table.insert(0x9900, 1, ThreadId::MAIN, false, &CallSite::empty()));
        assert_eq!(table.overflowed(), 1);
        assert_eq!(table.size_of(0x9900), None);
    }

    #[test]
    fn iteration_reports_owner_and_ignored() {
        let table = Box::new(AllocationTable::<16>::new());
        table.insert(0x2000, 10, ThreadId::new(3), true, &site(0x77));
        table.insert(0x3000, 20, ThreadId::new(4), false, &site(0x88));
        let mut seen = Vec::new();
        table.for_each_live(|e| seen.push((e.addr, e.size, e.owner, e.ignored)));
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (0x2000, 10, ThreadId::new(3), true),
                (0x3000, 20, ThreadId::new(4), false),
            ]
        );
    }

    #[test]
    fn concurrent_insert_remove_keeps_counts() {
        let table = Box::new(AllocationTable::<2048>::new());
        std::thread::scope(|s| {
            for t in 0..8usize {
                let table = &table;
                s.spawn(move || {
                    for i in 0..200usize {
                        let addr = (t + 1) << 24 | (i + 1) << 4;
                        assert!(table.insert(addr, 16, ThreadId::new(t as u32), false, &CallSite::empty()));
                        if i % 2 == 0 {
                            assert_eq!(table.remove(addr), Some(16));
                        }
                    }
                });
            }
        });
        assert_eq!(table.live_count(), 8 * 100);
        assert_eq!(table.live_bytes(), 8 * 100 * 16);
        let mut visited = 0;
        table.for_each_live(|_| visited += 1);
        assert_eq!(visited, 800);
    }
}
