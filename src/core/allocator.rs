//! Fixed-capacity allocator for pool-owned task entries.
//!
//! Slots are recycled, tickets are not: every allocation stamps its slot with
//! a fresh [`JobId`], and a [`TaskqId`] is only live while the slot still
//! carries the ticket it was issued with.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};
use uuid::Uuid;

use super::entry::{EntryKind, TaskFn, TaskqId};
use super::TaskqError;
use crate::executor::{JobId, TimerToken};

/// Contents of an allocated slot.
pub struct EntryRecord {
    kind: EntryKind,
    owner: Uuid,
    func: Option<TaskFn>,
    timer: Option<Arc<TimerToken>>,
}

impl EntryRecord {
    /// Record for a task owned by the queue identified by `owner`.
    pub fn new(kind: EntryKind, owner: Uuid, func: TaskFn) -> Self {
        Self {
            kind,
            owner,
            func: Some(func),
            timer: None,
        }
    }
}

/// Read-only view of a live entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Entry kind.
    pub kind: EntryKind,
    /// Uid of the queue the entry was dispatched to.
    pub owner: Uuid,
    /// Timer registration of a delayed entry, once armed.
    pub timer: Option<Arc<TimerToken>>,
}

#[derive(Default)]
struct Slot {
    ticket: Option<JobId>,
    record: Option<EntryRecord>,
}

/// Pool of reusable entry slots shared by every queue of a context.
pub struct EntryAllocator {
    slots: Vec<Mutex<Slot>>,
    free: Mutex<Vec<u32>>,
    available: Condvar,
    in_use: AtomicUsize,
    exhausted: AtomicU64,
}

impl EntryAllocator {
    /// Create an allocator with `capacity` slots (at most `u32::MAX`).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
            free: Mutex::new((0..capacity).rev().collect()),
            available: Condvar::new(),
            in_use: AtomicUsize::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Take a free slot and store `record` in it.
    ///
    /// With `blocking` the caller sleeps until a slot is released; otherwise
    /// an empty pool fails at once.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::AllocationExhausted` for a non-blocking request on
    /// an empty pool.
    pub fn allocate(&self, blocking: bool, record: EntryRecord) -> Result<TaskqId, TaskqError> {
        let index = {
            let mut free = self.free.lock();
            loop {
                if let Some(index) = free.pop() {
                    break index;
                }
                if !blocking {
                    self.exhausted.fetch_add(1, Ordering::Relaxed);
                    return Err(TaskqError::AllocationExhausted);
                }
                self.available.wait(&mut free);
            }
        };

        let ticket = JobId::next();
        {
            let mut slot = self.slots[index as usize].lock();
            slot.ticket = Some(ticket);
            slot.record = Some(record);
        }
        self.in_use.fetch_add(1, Ordering::Relaxed);

        let id = TaskqId::new(index, ticket);
        trace!(task_id = %id, "Entry allocated");
        Ok(id)
    }

    /// Return a slot to the pool. Callers must own the entry; in practice the
    /// only caller is the guard that travels with the entry's job.
    pub fn release(&self, id: TaskqId) {
        let Some(slot) = self.slots.get(id.slot() as usize) else {
            error!(task_id = %id, "Release of a handle outside the allocator");
            debug_assert!(false, "release of a handle outside the allocator");
            return;
        };

        let record = {
            let mut slot = slot.lock();
            if slot.ticket != Some(id.job_id()) {
                drop(slot);
                error!(task_id = %id, "Release of a stale entry");
                debug_assert!(false, "release of a stale entry");
                return;
            }
            slot.ticket = None;
            slot.record.take()
        };
        // Drop the function and timer outside the slot lock
        drop(record);

        self.free.lock().push(id.slot());
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.available.notify_one();
        trace!(task_id = %id, "Entry released");
    }

    /// Look up a live entry. `Ok(None)` means the handle is stale.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::InvalidHandle` if the slot index is out of range.
    pub fn inspect(&self, id: TaskqId) -> Result<Option<EntryInfo>, TaskqError> {
        let slot = self.slot(id)?.lock();
        if slot.ticket != Some(id.job_id()) {
            return Ok(None);
        }
        Ok(slot.record.as_ref().map(|record| EntryInfo {
            kind: record.kind,
            owner: record.owner,
            timer: record.timer.clone(),
        }))
    }

    /// Take the function out of a live entry so it can run.
    pub fn take_func(&self, id: TaskqId) -> Option<TaskFn> {
        let mut slot = self.slot(id).ok()?.lock();
        if slot.ticket != Some(id.job_id()) {
            return None;
        }
        slot.record.as_mut().and_then(|record| record.func.take())
    }

    /// Remember the timer registration of a delayed entry. Returns `false` if
    /// the entry is no longer live.
    pub fn attach_timer(&self, id: TaskqId, token: Arc<TimerToken>) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let mut slot = slot.lock();
        if slot.ticket != Some(id.job_id()) {
            return false;
        }
        match slot.record.as_mut() {
            Some(record) => {
                record.timer = Some(token);
                true
            }
            None => false,
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently allocated.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Non-blocking allocations refused so far.
    #[must_use]
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    fn slot(&self, id: TaskqId) -> Result<&Mutex<Slot>, TaskqError> {
        self.slots
            .get(id.slot() as usize)
            .ok_or(TaskqError::InvalidHandle)
    }
}

/// Owns a pool-owned entry on behalf of its job and releases it on drop.
///
/// Exactly one guard exists per allocation and it moves with the job, so the
/// entry is released exactly once by whoever ends up holding the job: the
/// worker after running it, or the canceller that removed it.
pub(crate) struct EntryGuard {
    allocator: Arc<EntryAllocator>,
    id: TaskqId,
}

impl EntryGuard {
    pub(crate) const fn new(allocator: Arc<EntryAllocator>, id: TaskqId) -> Self {
        Self { allocator, id }
    }

    /// Run the entry's function; the entry is released when this returns or unwinds.
    pub(crate) fn run(self) {
        if let Some(func) = self.allocator.take_func(self.id) {
            func();
        }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.allocator.release(self.id);
    }
}
