//! Conservative reachability marking over live blocks.
//!
//! Any aligned word whose value falls inside a live block (interior pointers
//! included) marks that block. Marked blocks are scanned in turn.

use crate::engine::LiveAllocation;

const WORD: usize = std::mem::size_of::<usize>();

/// Mark state for one leak check.
pub struct Reachability {
    /// `(start, end)` of each live block, sorted by start.
    blocks: Vec<(usize, usize)>,
    marked: Vec<bool>,
    pending: Vec<usize>,
}

impl Reachability {
    #[must_use]
    pub fn new(live: &[LiveAllocation]) -> Self {
        let mut blocks: Vec<(usize, usize)> = live
            .iter()
            .map(|a| (a.addr, a.addr + a.size.max(1)))
            .collect();
        blocks.sort_unstable();
        let marked = vec![false; blocks.len()];
        Self {
            blocks,
            marked,
            pending: Vec::new(),
        }
    }

    fn find(&self, value: usize) -> Option<usize> {
        let idx = self.blocks.partition_point(|&(start, _)| start <= value);
        let idx = idx.checked_sub(1)?;
        let (start, end) = self.blocks[idx];
        (value >= start && value < end).then_some(idx)
    }

    /// Marks the block containing `value`, if any.
    pub fn mark_value(&mut self, value: usize) {
        if let Some(idx) = self.find(value)
            && !self.marked[idx]
        {
            self.marked[idx] = true;
            self.pending.push(idx);
        }
    }

    /// Treats every aligned word in `[begin, end)` as a potential pointer.
    ///
    /// # Safety
    /// The range must be readable for its whole length.
    pub unsafe fn scan_range(&mut self, begin: usize, end: usize) {
        let mut cursor = begin.next_multiple_of(WORD);
        while cursor.saturating_add(WORD) <= end {
            // SAFETY: caller guarantees the range is readable; cursor is aligned.
            let value = unsafe { (cursor as *const usize).read_volatile() };
            self.mark_value(value);
            cursor += WORD;
        }
    }

    /// Scans marked blocks until no new block is marked.
    ///
    /// # Safety
    /// Every block handed to [`Reachability::new`] must still be live.
    pub unsafe fn propagate(&mut self) {
        while let Some(idx) = self.pending.pop() {
            let (start, end) = self.blocks[idx];
            // SAFETY: live blocks are readable for their requested size.
            unsafe { self.scan_range(start, end) };
        }
    }

    #[must_use]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.find(addr).is_some_and(|idx| self.marked[idx])
    }
}

/// Writable `PT_LOAD` segments of every loaded object, as `(start, end)`.
#[cfg(target_os = "linux")]
#[must_use]
pub fn global_data_ranges() -> Vec<(usize, usize)> {
    use std::ffi::{c_int, c_void};

    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        // SAFETY: dl_iterate_phdr hands a valid info record; data is our Vec.
        let (info, ranges) = unsafe { (&*info, &mut *data.cast::<Vec<(usize, usize)>>()) };
        if info.dlpi_phdr.is_null() {
            return 0;
        }
        // SAFETY: dlpi_phdr points at dlpi_phnum headers.
        let headers =
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
        for ph in headers {
            if ph.p_type == libc::PT_LOAD && ph.p_flags & libc::PF_W != 0 && ph.p_memsz > 0 {
                let start = info.dlpi_addr as usize + ph.p_vaddr as usize;
                ranges.push((start, start + ph.p_memsz as usize));
            }
        }
        0
    }

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    // SAFETY: the callback only touches the Vec passed through data.
    unsafe {
        libc::dl_iterate_phdr(Some(collect), (&raw mut ranges).cast());
    }
    ranges
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn global_data_ranges() -> Vec<(usize, usize)> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsite::CallSite;
    use crate::engine::ThreadId;

    fn live(addr: usize, size: usize) -> LiveAllocation {
        LiveAllocation {
            addr,
            size,
            owner: ThreadId::MAIN,
            ignored: false,
            trace: CallSite::empty(),
        }
    }

    #[test]
    fn interior_pointers_mark_the_block() {
        let mut reach = Reachability::new(&[live(0x1000, 64), live(0x2000, 16)]);
        reach.mark_value(0x1020);
        assert!(reach.is_marked(0x1000));
        assert!(!reach.is_marked(0x2000));
    }

    #[test]
    fn one_past_the_end_does_not_mark() {
        let mut reach = Reachability::new(&[live(0x1000, 64)]);
        reach.mark_value(0x1040);
        reach.mark_value(0x0fff);
        assert!(!reach.is_marked(0x1000));
    }

    #[test]
    fn marking_follows_chains_through_blocks() {
        let tail = Box::new([0usize; 2]);
        let mut head = Box::new([0usize; 2]);
        head[1] = tail.as_ptr() as usize;
        let unrelated = Box::new([0usize; 2]);

        let blocks = [
            live(head.as_ptr() as usize, 16),
            live(tail.as_ptr() as usize, 16),
            live(unrelated.as_ptr() as usize, 16),
        ];
        let mut reach = Reachability::new(&blocks);
        reach.mark_value(head.as_ptr() as usize);
        unsafe { reach.propagate() };

        assert!(reach.is_marked(tail.as_ptr() as usize));
        assert!(!reach.is_marked(unrelated.as_ptr() as usize));
    }

    #[test]
    fn scan_range_reads_every_aligned_word() {
        let target = Box::new(0u64);
        let buffer = [0usize, 0, target.as_ref() as *const u64 as usize, 0];
        let mut reach = Reachability::new(&[live(target.as_ref() as *const u64 as usize, 8)]);
        let begin = buffer.as_ptr() as usize;
        unsafe { reach.scan_range(begin, begin + std::mem::size_of_val(&buffer)) };
        assert!(reach.is_marked(target.as_ref() as *const u64 as usize));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn writable_segments_cover_our_statics() {
        static MARKER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(7);
        let addr = &raw const MARKER as usize;
        let ranges = global_data_ranges();
        assert!(ranges.iter().any(|&(s, e)| addr >= s && addr < e));
    }
}
