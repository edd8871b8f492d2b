//! Task entries, handles and dispatch flags.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::executor::{JobId, JobPriority, PRIORITY_DEFAULT, PRIORITY_FRONT};

/// Function bound to its argument, ready to run once.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a dispatched pool-owned entry, used for cancel and wait.
///
/// The slot index locates the entry in the allocator; the ticket is the
/// never-reused identity of this particular dispatch. Once the entry has been
/// released the slot's ticket changes and the handle is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskqId {
    slot: u32,
    ticket: JobId,
}

impl TaskqId {
    pub(crate) const fn new(slot: u32, ticket: JobId) -> Self {
        Self { slot, ticket }
    }

    /// Allocator slot this handle points at.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Executor identity of the dispatch.
    #[must_use]
    pub const fn job_id(self) -> JobId {
        self.ticket
    }
}

impl fmt::Display for TaskqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticket, self.slot)
    }
}

/// How an entry reaches the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Queued at dispatch time.
    Normal,
    /// Queued by the timer thread once `deadline` passes.
    Timeout {
        /// Absolute time the entry becomes runnable.
        deadline: Instant,
    },
}

/// Result of [`Taskq::cancel_id`](crate::core::Taskq::cancel_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The entry had not started; it will never run and has been released.
    Cancelled,
    /// Too late: the entry is running or has been committed to run.
    AlreadyStarted,
    /// No such live entry: it already completed, was cancelled, or the
    /// handle was `None`.
    NotFound,
}

/// Flags accepted by the dispatch family.
///
/// `sleep` lets the allocation wait for a free entry; `noqueue` overrides it
/// and forces a non-blocking allocation; `front` queues ahead of
/// normal-priority work already pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchFlags {
    sleep: bool,
    noqueue: bool,
    front: bool,
}

impl DispatchFlags {
    /// Allocation may block until an entry is free.
    pub const SLEEP: Self = Self {
        sleep: true,
        noqueue: false,
        front: false,
    };

    /// Allocation fails immediately when no entry is free.
    pub const NOSLEEP: Self = Self {
        sleep: false,
        noqueue: false,
        front: false,
    };

    /// Queue ahead of normal-priority work.
    #[must_use]
    pub const fn front(self) -> Self {
        Self { front: true, ..self }
    }

    /// Never block in the allocator, even with `SLEEP`.
    #[must_use]
    pub const fn noqueue(self) -> Self {
        Self {
            noqueue: true,
            ..self
        }
    }

    /// Whether allocation may suspend the caller.
    #[must_use]
    pub const fn may_sleep(self) -> bool {
        self.sleep && !self.noqueue
    }

    /// Whether the front flag is set.
    #[must_use]
    pub const fn is_front(self) -> bool {
        self.front
    }

    /// Pending-list priority selected by these flags.
    #[must_use]
    pub const fn priority(self) -> JobPriority {
        if self.front {
            PRIORITY_FRONT
        } else {
            PRIORITY_DEFAULT
        }
    }
}

#[derive(Debug)]
struct EntShared {
    id: JobId,
    in_flight: AtomicUsize,
    runs: AtomicU64,
}

/// Caller-owned task entry.
///
/// Lets a call site dispatch the same logical work over and over without going
/// through the allocator. The queue never frees it; it is pending from dispatch
/// until its function returns. Dispatching it again while it is still queued
/// replaces the queued function and keeps its place in line.
#[derive(Debug)]
pub struct TaskqEnt {
    shared: Arc<EntShared>,
}

impl TaskqEnt {
    /// Create an idle entry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EntShared {
                id: JobId::next(),
                in_flight: AtomicUsize::new(0),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Whether the entry is queued or running.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire) != 0
    }

    /// Number of times the entry's function has returned.
    #[must_use]
    pub fn completed_runs(&self) -> u64 {
        self.shared.runs.load(Ordering::Acquire)
    }

    /// Executor identity of this entry.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.shared.id
    }

    pub(crate) fn begin_flight(&self) -> EntInFlight {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        EntInFlight {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for TaskqEnt {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a caller-owned entry pending for as long as its job exists.
pub(crate) struct EntInFlight {
    shared: Arc<EntShared>,
}

impl EntInFlight {
    /// Record a completed run; the entry stops being pending when this drops.
    pub(crate) fn complete(self) {
        self.shared.runs.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for EntInFlight {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
