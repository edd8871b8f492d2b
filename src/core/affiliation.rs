//! Which queue a worker thread belongs to.
//!
//! Workers register on start and unregister on exit. The map is keyed by
//! thread identity, so a lookup answers for the calling thread no matter which
//! queue dispatched the task it is running.

use std::collections::HashMap;
use std::sync::Weak;
use std::thread::{self, ThreadId};

use parking_lot::RwLock;
use tracing::trace;

use super::taskq::{Taskq, TaskqInner};

/// Map from worker thread to the queue that owns it.
#[derive(Default)]
pub struct AffiliationRegistry {
    threads: RwLock<HashMap<ThreadId, Weak<TaskqInner>>>,
}

impl AffiliationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, thread: ThreadId, taskq: Weak<TaskqInner>) {
        self.threads.write().insert(thread, taskq);
        trace!(thread = ?thread, "Worker affiliated");
    }

    pub(crate) fn unregister(&self, thread: ThreadId) {
        self.threads.write().remove(&thread);
        trace!(thread = ?thread, "Worker unaffiliated");
    }

    /// Queue owning `thread`, if it is a live worker.
    #[must_use]
    pub fn lookup(&self, thread: ThreadId) -> Option<Taskq> {
        self.threads
            .read()
            .get(&thread)
            .and_then(Weak::upgrade)
            .map(Taskq::from_inner)
    }

    /// Queue owning the calling thread, or `None` for non-worker threads.
    #[must_use]
    pub fn current(&self) -> Option<Taskq> {
        self.lookup(thread::current().id())
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Whether no worker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}
