//! Engine-side thread registry.
//!
//! Identifiers come from a monotonically increasing counter and are never reused.
//! Records live behind a `parking_lot` mutex; the registry is only touched from
//! thread creation, start and finish, never from an allocation path.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::engine::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Identifier assigned by the parent; the child has not checked in yet.
    Created,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub parent: ThreadId,
    pub detached: bool,
    pub os_id: u64,
    pub state: ThreadState,
}

pub struct ThreadRegistry {
    next_id: AtomicU32,
    records: Mutex<Vec<ThreadRecord>>,
    created: AtomicUsize,
    finished: AtomicUsize,
}

impl ThreadRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Registry whose next created thread receives `next_id`.
    #[must_use]
    pub const fn starting_at(next_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(next_id),
            records: parking_lot::const_mutex(Vec::new()),
            created: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Record the main thread as [`ThreadId::MAIN`]. Idempotent.
    pub fn register_main(&self, os_id: u64) {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.id == ThreadId::MAIN) {
            return;
        }
        records.push(ThreadRecord {
            id: ThreadId::MAIN,
            parent: ThreadId::MAIN,
            detached: false,
            os_id,
            state: ThreadState::Running,
        });
    }

    /// Assign the next identifier. Wraps to [`ThreadId::MAIN`] after `u32::MAX`
    /// threads; callers treat that as a fatal collision.
    pub fn create(&self, parent: ThreadId, detached: bool) -> ThreadId {
        let id = ThreadId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        if id == ThreadId::MAIN {
            return id;
        }
        self.records.lock().push(ThreadRecord {
            id,
            parent,
            detached,
            os_id: 0,
            state: ThreadState::Created,
        });
        self.created.fetch_add(1, Ordering::Relaxed);
        id
    }

    pub fn start(&self, id: ThreadId, os_id: u64) -> bool {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.os_id = os_id;
                record.state = ThreadState::Running;
                true
            }
            None => false,
        }
    }

    /// Drop the record of a finished thread.
    pub fn finish(&self, id: ThreadId) -> bool {
        let mut records = self.records.lock();
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return false;
        };
        records.swap_remove(pos);
        drop(records);
        self.finished.fetch_add(1, Ordering::Relaxed);
        true
    }

    #[must_use]
    pub fn get(&self, id: ThreadId) -> Option<ThreadRecord> {
        self.records.lock().iter().find(|r| r.id == id).copied()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::Relaxed)
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
