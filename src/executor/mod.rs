//! Worker-thread executor backing every task queue.
//!
//! `ThreadQueue` owns a private pending list, a fixed set of OS worker threads
//! and a timer thread for delayed work. It knows nothing about task entries or
//! the allocator; it runs opaque [`Job`]s identified by a [`JobId`].

pub mod pending;
pub mod thread_queue;
pub mod timer;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use pending::PendingQueue;
pub use thread_queue::{Enqueued, QueueCounts, ThreadCallback, ThreadHook, ThreadQueue};
pub use timer::{TimerCancel, TimerToken, TimerWheel};

/// A unit of work handed to the executor.
///
/// Whoever holds the box owns the work: running it or dropping it are the only
/// two ways it leaves the executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling priority used by the pending list. Higher runs first.
pub type JobPriority = u8;

/// Priority of ordinary submissions.
pub const PRIORITY_DEFAULT: JobPriority = 0;

/// Priority of front-of-queue submissions.
pub const PRIORITY_FRONT: JobPriority = 1;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a submitted job. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Draw a fresh id.
    pub fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}
