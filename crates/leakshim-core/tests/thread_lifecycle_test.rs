//! Thread creation handoff with real OS threads.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use leakshim_core::engine::{CountingEngine, LeakEngine, SystemBacking, ThreadId};
use leakshim_core::lifecycle::{
    FinalizeCountdown, FinalizeStep, ThreadHandoff, begin_child, confirm_launch, finish_thread,
};
use leakshim_core::reentrancy::ThreadContext;

type TestEngine = CountingEngine<SystemBacking, 64>;

static ENTRY_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn count_entry(arg: *mut c_void) -> *mut c_void {
    ENTRY_CALLS.fetch_add(1, Ordering::SeqCst);
    arg
}

fn os_tid() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() as u64 }
}

/// Drive the destructor countdown the way the TSD machinery does and finish the
/// thread on the last pass.
fn run_finalize_passes(engine: &TestEngine) -> (usize, Option<ThreadId>) {
    let mut countdown = FinalizeCountdown::ARMED;
    let mut passes = 0;
    loop {
        passes += 1;
        match countdown.step() {
            FinalizeStep::Rearm(next) => countdown = FinalizeCountdown::from_raw(next),
            FinalizeStep::Finish => return (passes, finish_thread(engine)),
        }
    }
}

#[test]
fn concurrent_creations_get_distinct_identifiers() {
    const THREADS: usize = 32;
    let engine = Box::new(TestEngine::new(SystemBacking));
    engine.lazy_initialize(os_tid());

    let handoffs: Vec<ThreadHandoff> = (0..THREADS)
        .map(|i| ThreadHandoff::new(count_entry, (i + 1) as *mut c_void))
        .collect();

    let (parent_ids, child_ids) = std::thread::scope(|s| {
        let children: Vec<_> = handoffs
            .iter()
            .map(|handoff| {
                let engine = &*engine;
                s.spawn(move || {
                    let (entry, arg) = begin_child(engine, handoff, os_tid());
                    let seen = ThreadContext::current_thread();
                    let out = unsafe { entry(arg) } as usize;
                    let (passes, finished) = run_finalize_passes(engine);
                    assert_eq!(finished, Some(seen));
                    (seen, out, passes)
                })
            })
            .collect();

        let parent_ids: Vec<ThreadId> = handoffs
            .iter()
            .map(|handoff| confirm_launch(&*engine, handoff, ThreadId::MAIN, false).unwrap())
            .collect();
        let child_ids: Vec<_> = children.into_iter().map(|c| c.join().unwrap()).collect();
        (parent_ids, child_ids)
    });

    let unique: HashSet<_> = parent_ids.iter().copied().collect();
    assert_eq!(unique.len(), THREADS);
    assert!(!unique.contains(&ThreadId::MAIN));

    for (i, (parent_view, (child_view, out, passes))) in
        parent_ids.iter().zip(&child_ids).enumerate()
    {
        assert_eq!(parent_view, child_view);
        assert_eq!(*out, i + 1);
        assert_eq!(*passes, leakshim_core::lifecycle::PTHREAD_DESTRUCTOR_ITERATIONS);
    }

    assert!(ENTRY_CALLS.load(Ordering::SeqCst) >= THREADS);
    let stats = engine.stats();
    assert_eq!(stats.threads_created, THREADS);
    assert_eq!(stats.threads_finished, THREADS);
    assert_eq!(engine.threads().live_count(), 1, "only the main thread remains");
}

#[test]
fn identifiers_are_never_reused() {
    let engine = Box::new(TestEngine::new(SystemBacking));
    engine.lazy_initialize(os_tid());
    let mut seen = HashSet::new();

    for round in 0..8 {
        let handoff = ThreadHandoff::new(count_entry, std::ptr::null_mut());
        let id = std::thread::scope(|s| {
            let child = s.spawn(|| {
                begin_child(&*engine, &handoff, os_tid());
                finish_thread(&*engine)
            });
            let id = confirm_launch(&*engine, &handoff, ThreadId::MAIN, round % 2 == 0).unwrap();
            assert_eq!(child.join().unwrap(), Some(id));
            id
        });
        assert!(seen.insert(id), "identifier {id} handed out twice");
    }
}

#[test]
fn child_threads_record_their_parent() {
    let engine = Box::new(TestEngine::new(SystemBacking));
    engine.lazy_initialize(os_tid());

    let outer = ThreadHandoff::new(count_entry, std::ptr::null_mut());
    let inner = ThreadHandoff::new(count_entry, std::ptr::null_mut());

    let (outer_id, inner_id) = std::thread::scope(|s| {
        let child = s.spawn(|| {
            begin_child(&*engine, &outer, os_tid());
            let parent = ThreadContext::current_thread();
            let inner_id = std::thread::scope(|s2| {
                let grandchild = s2.spawn(|| {
                    begin_child(&*engine, &inner, os_tid());
                    ThreadContext::current_thread()
                });
                let id = confirm_launch(&*engine, &inner, parent, true).unwrap();
                assert_eq!(grandchild.join().unwrap(), id);
                id
            });
            (parent, inner_id)
        });
        confirm_launch(&*engine, &outer, ThreadId::MAIN, false).unwrap();
        child.join().unwrap()
    });

    let record = engine.threads().get(inner_id).expect("inner thread registered");
    assert_eq!(record.parent, outer_id);
    assert!(record.detached);
}
