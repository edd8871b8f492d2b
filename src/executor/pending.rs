//! Pending list ordered by priority, FIFO within a priority.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::{Job, JobId, JobPriority};

/// Position of a job in the pending list.
///
/// Orders highest priority first and, within one priority, earliest
/// submission first, so the smallest key is always the next job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingKey {
    priority: JobPriority,
    seq: u64,
}

impl PartialOrd for PendingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            other => other,
        }
    }
}

/// Jobs waiting for a worker.
///
/// O(log n) push, pop and removal by id. A job id appears at most once.
#[derive(Default)]
pub struct PendingQueue {
    jobs: BTreeMap<PendingKey, (JobId, Job)>,
    index: HashMap<JobId, PendingKey>,
    next_seq: u64,
}

impl PendingQueue {
    /// Create an empty pending list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` under `id`.
    ///
    /// If `id` is already queued its job is replaced in place and the old one
    /// is returned; the queued position does not change.
    pub fn push(&mut self, id: JobId, priority: JobPriority, job: Job) -> Option<Job> {
        if let Some(key) = self.index.get(&id) {
            if let Some(slot) = self.jobs.get_mut(key) {
                return Some(std::mem::replace(&mut slot.1, job));
            }
        }
        let key = PendingKey {
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(id, key);
        self.jobs.insert(key, (id, job));
        None
    }

    /// Take the next job to run.
    pub fn pop(&mut self) -> Option<(JobId, Job)> {
        let (_, (id, job)) = self.jobs.pop_first()?;
        self.index.remove(&id);
        Some((id, job))
    }

    /// Remove a queued job. `None` if it is not queued (running, done or unknown).
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let key = self.index.remove(&id)?;
        self.jobs.remove(&key).map(|(_, job)| job)
    }

    /// Whether `id` is queued.
    #[must_use]
    pub fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
