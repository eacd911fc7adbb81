//! Allocation-free diagnostics.
//!
//! Anything printed from an allocator entry point goes through here: messages are
//! formatted into a fixed stack buffer and written to fd 2 with `write(2)`, so a
//! report can be produced while `malloc` itself is the caller.

use core::fmt::{self, Write};
use std::ffi::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config;
use crate::error::ShimError;

/// Capacity of a single diagnostic line.
pub const LINE_CAPACITY: usize = 512;

/// Fixed-capacity formatting buffer. Output past the capacity is dropped.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> StackWriter<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Write the buffered bytes to stderr and reset the buffer.
    pub fn flush_stderr(&mut self) {
        write_stderr(self.as_bytes());
        self.len = 0;
        self.truncated = false;
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() {
            self.truncated = true;
        }
        Ok(())
    }
}

/// Unbuffered stderr sink; every `write_str` is one `write(2)` loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl Write for StderrSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_stderr(s.as_bytes());
        Ok(())
    }
}

/// Write all of `bytes` to fd 2, retrying on short writes and `EINTR`.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: pointer/length come from a live slice.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            // SAFETY: errno is thread-local.
            if unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Emit one `==<pid>== ` prefixed line to stderr.
pub fn emit(args: fmt::Arguments<'_>) {
    let mut line = StackWriter::<LINE_CAPACITY>::new();
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };
    let _ = write!(line, "=={pid}== ");
    let _ = line.write_fmt(args);
    if line.is_truncated() {
        // Keep the newline even when the payload was cut.
        line.len = line.len.min(LINE_CAPACITY - 1);
    }
    let _ = line.write_str("\n");
    line.flush_stderr();
}

/// Emit a line when the configured verbosity is at least `level`.
pub fn emit_verbose(level: u8, args: fmt::Arguments<'_>) {
    if config::verbosity() >= level {
        emit(args);
    }
}

/// `diag_report!(level = n, "fmt", args..)` prints when verbosity >= n;
/// `diag_report!("fmt", args..)` always prints.
#[macro_export]
macro_rules! diag_report {
    (level = $level:expr, $($arg:tt)+) => {
        $crate::diag::emit_verbose($level, format_args!($($arg)+))
    };
    ($($arg:tt)+) => {
        $crate::diag::emit(format_args!($($arg)+))
    };
}

/// Process terminator used by [`die`]. Stored as a raw address; 0 means
/// `libc::_exit`.
static TERMINATOR: AtomicUsize = AtomicUsize::new(0);

pub type TerminateFn = unsafe extern "C" fn(c_int) -> !;

/// Route fatal termination through `f` (the resolved real `_exit`).
pub fn install_terminator(f: TerminateFn) {
    TERMINATOR.store(f as usize, Ordering::Release);
}

/// Terminate immediately with `status`, skipping atexit handlers.
pub fn terminate(status: c_int) -> ! {
    let raw = TERMINATOR.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: only `install_terminator` stores non-zero values, always a
        // `TerminateFn`.
        let f = unsafe { core::mem::transmute::<usize, TerminateFn>(raw) };
        // SAFETY: terminator has `_exit` semantics.
        unsafe { f(status) }
    }
    // SAFETY: _exit never returns.
    unsafe { libc::_exit(status) }
}

/// Report a fatal internal error and terminate with the configured exit code.
pub fn die(err: &ShimError) -> ! {
    emit(format_args!("ERROR: leakshim: {err}"));
    terminate(config::exitcode())
}

/// Like [`die`], also printing the captured call-site frames.
pub fn die_at(err: &ShimError, frames: &[usize]) -> ! {
    emit(format_args!("ERROR: leakshim: {err}"));
    for (i, ip) in frames.iter().enumerate() {
        emit(format_args!("    #{i} {ip:#x}"));
    }
    terminate(config::exitcode())
}
