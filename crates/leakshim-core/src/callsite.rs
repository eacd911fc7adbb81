//! Allocation call-site capture.
//!
//! A [`CallSite`] is a fixed array of return addresses captured on the stack of the
//! allocating thread. Capture never allocates: frames are walked with the
//! unsynchronized tracer and copied into the array as they are produced.

use std::ffi::c_void;
use std::fmt;

/// Maximum frames captured per allocation.
pub const MAX_TRACE_DEPTH: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    frames: [usize; MAX_TRACE_DEPTH],
    len: u8,
}

impl CallSite {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            frames: [0; MAX_TRACE_DEPTH],
            len: 0,
        }
    }

    /// Capture up to `max_depth` frames of the caller's stack, skipping the
    /// innermost `skip` frames (the capture machinery and interceptor glue).
    ///
    /// The caller must hold the reentrancy guard: the unwinder may lazily
    /// initialize and allocate on first use.
    #[inline(never)]
    #[must_use]
    pub fn capture(skip: usize, max_depth: usize) -> Self {
        let mut site = Self::empty();
        let limit = max_depth.min(MAX_TRACE_DEPTH);
        if limit == 0 {
            return site;
        }
        // One extra frame for `capture` itself.
        let mut to_skip = skip + 1;
        // SAFETY: the closure neither panics nor calls back into the tracer.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if to_skip > 0 {
                    to_skip -= 1;
                    return true;
                }
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return false;
                }
                site.frames[site.len as usize] = ip;
                site.len += 1;
                (site.len as usize) < limit
            });
        }
        site
    }

    /// Build a call-site from known addresses; extra frames are dropped.
    #[must_use]
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut site = Self::empty();
        let n = frames.len().min(MAX_TRACE_DEPTH);
        site.frames[..n].copy_from_slice(&frames[..n]);
        site.len = n as u8;
        site
    }

    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// FNV-1a over the frame addresses; identical stacks group together in
    /// leak reports.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for ip in self.frames() {
            for byte in ip.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(PRIME);
            }
        }
        hash
    }
}

impl Default for CallSite {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for ip in self.frames() {
            list.entry(&format_args!("{ip:#x}"));
        }
        list.finish()
    }
}

/// A resolved frame for report rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Symbolize one return address. Allocates; only call at report time.
#[must_use]
pub fn symbolize(ip: usize) -> Option<FrameInfo> {
    let mut info = None;
    // Return addresses point past the call instruction.
    let lookup = ip.saturating_sub(1) as *mut c_void;
    backtrace::resolve(lookup, |symbol| {
        if info.is_some() {
            return;
        }
        info = Some(FrameInfo {
            function: symbol.name().map(|name| name.to_string()),
            file: symbol.filename().map(|p| p.display().to_string()),
            line: symbol.lineno(),
        });
    });
    info
}
