//! Declarative table of every intercepted entry point.
//!
//! The ABI crate exports one function per row. The table records how each entry is
//! routed and what it does when the engine cannot satisfy it; it backs the startup
//! diagnostics and the completeness tests.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    CAllocator,
    CxxOperator,
    Thread,
    Process,
    Guarded,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Routing {
    /// Fresh allocation: bootstrap while initializing, engine otherwise.
    Allocate,
    /// Aligned allocation, always through the engine.
    AllocateAligned,
    /// Bootstrap-owned pointers go back to the bootstrap allocator.
    Reallocate,
    Free,
    SizeQuery,
    ThreadLifecycle,
    ProcessExit,
    /// Forwarded to the real symbol with the reentrancy guard held.
    UnderGuard,
    PassThrough,
    Stub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnFailure {
    ReturnNull,
    /// Null (or an error code) with `errno` set.
    ReturnErrno,
    /// Fatal out-of-memory report, then terminate.
    FatalOom,
    /// The real function's result is returned unchanged.
    Forward,
    Infallible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptSpec {
    pub symbol: &'static str,
    pub family: Family,
    pub routing: Routing,
    pub on_failure: OnFailure,
}

macro_rules! intercept_table {
    ($( $symbol:literal => $family:ident, $routing:ident, $on_failure:ident; )*) => {
        pub static INTERCEPTS: &[InterceptSpec] = &[
            $(
                InterceptSpec {
                    symbol: $symbol,
                    family: Family::$family,
                    routing: Routing::$routing,
                    on_failure: OnFailure::$on_failure,
                },
            )*
        ];
    };
}

intercept_table! {
    "malloc" => CAllocator, Allocate, ReturnNull;
    "calloc" => CAllocator, Allocate, ReturnErrno;
    "realloc" => CAllocator, Reallocate, ReturnNull;
    "reallocarray" => CAllocator, Reallocate, ReturnErrno;
    "free" => CAllocator, Free, Infallible;
    "cfree" => CAllocator, Free, Infallible;
    "posix_memalign" => CAllocator, AllocateAligned, ReturnErrno;
    "memalign" => CAllocator, AllocateAligned, ReturnErrno;
    "__libc_memalign" => CAllocator, AllocateAligned, ReturnErrno;
    "aligned_alloc" => CAllocator, AllocateAligned, ReturnErrno;
    "valloc" => CAllocator, AllocateAligned, ReturnNull;
    "pvalloc" => CAllocator, AllocateAligned, ReturnErrno;
    "malloc_usable_size" => CAllocator, SizeQuery, Infallible;

    "_Znwm" => CxxOperator, AllocateAligned, FatalOom;
    "_Znam" => CxxOperator, AllocateAligned, FatalOom;
    "_ZnwmRKSt9nothrow_t" => CxxOperator, AllocateAligned, ReturnNull;
    "_ZnamRKSt9nothrow_t" => CxxOperator, AllocateAligned, ReturnNull;
    "_ZnwmSt11align_val_t" => CxxOperator, AllocateAligned, FatalOom;
    "_ZnamSt11align_val_t" => CxxOperator, AllocateAligned, FatalOom;
    "_ZnwmSt11align_val_tRKSt9nothrow_t" => CxxOperator, AllocateAligned, ReturnNull;
    "_ZnamSt11align_val_tRKSt9nothrow_t" => CxxOperator, AllocateAligned, ReturnNull;

    "_ZdlPv" => CxxOperator, Free, Infallible;
    "_ZdaPv" => CxxOperator, Free, Infallible;
    "_ZdlPvRKSt9nothrow_t" => CxxOperator, Free, Infallible;
    "_ZdaPvRKSt9nothrow_t" => CxxOperator, Free, Infallible;
    "_ZdlPvm" => CxxOperator, Free, Infallible;
    "_ZdaPvm" => CxxOperator, Free, Infallible;
    "_ZdlPvSt11align_val_t" => CxxOperator, Free, Infallible;
    "_ZdaPvSt11align_val_t" => CxxOperator, Free, Infallible;
    "_ZdlPvSt11align_val_tRKSt9nothrow_t" => CxxOperator, Free, Infallible;
    "_ZdaPvSt11align_val_tRKSt9nothrow_t" => CxxOperator, Free, Infallible;
    "_ZdlPvmSt11align_val_t" => CxxOperator, Free, Infallible;
    "_ZdaPvmSt11align_val_t" => CxxOperator, Free, Infallible;

    "pthread_create" => Thread, ThreadLifecycle, Forward;
    "pthread_join" => Thread, PassThrough, Forward;

    "_exit" => Process, ProcessExit, Infallible;
    "exit" => Process, ProcessExit, Infallible;
    "__libc_start_main" => Process, ProcessExit, Forward;

    "atexit" => Guarded, UnderGuard, Forward;
    "__cxa_atexit" => Guarded, UnderGuard, Forward;
    "pthread_atfork" => Guarded, UnderGuard, Forward;
    "strerror" => Guarded, UnderGuard, Forward;

    "mallinfo" => NoOp, Stub, Infallible;
    "mallopt" => NoOp, Stub, Infallible;
    "mcheck" => NoOp, Stub, Infallible;
    "mcheck_pedantic" => NoOp, Stub, Infallible;
    "mprobe" => NoOp, Stub, Infallible;
}

/// Find a symbol's row.
#[must_use]
pub fn lookup(symbol: &str) -> Option<&'static InterceptSpec> {
    INTERCEPTS.iter().find(|row| row.symbol == symbol)
}

pub fn count_by_family(family: Family) -> usize {
    INTERCEPTS.iter().filter(|row| row.family == family).count()
}
