//! Process-scoped state shared by a family of task queues.

use std::sync::Arc;
use std::thread::ThreadId;

use tracing::info;

use super::affiliation::AffiliationRegistry;
use super::allocator::EntryAllocator;
use super::taskq::Taskq;
use super::TaskqError;
use crate::config::ContextConfig;

/// Entry allocator, affiliation registry and hardware parallelism used by
/// every [`Taskq`] created from it.
///
/// Create one before the first queue and drop it after the last; queues keep
/// it alive through their own reference.
pub struct TaskqContext {
    allocator: Arc<EntryAllocator>,
    registry: AffiliationRegistry,
    parallelism: usize,
}

impl TaskqContext {
    /// Build a context from configuration.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: &ContextConfig) -> Result<Arc<Self>, TaskqError> {
        config.validate().map_err(TaskqError::InvalidConfig)?;
        let parallelism = config.parallelism.unwrap_or_else(num_cpus::get).max(1);

        info!(
            max_entries = config.max_entries,
            parallelism = parallelism,
            "Task queue context initialized"
        );

        Ok(Arc::new(Self {
            allocator: Arc::new(EntryAllocator::new(config.max_entries)),
            registry: AffiliationRegistry::new(),
            parallelism,
        }))
    }

    /// Entry allocator shared by all queues of this context.
    #[must_use]
    pub const fn allocator(&self) -> &Arc<EntryAllocator> {
        &self.allocator
    }

    /// Hardware parallelism used to resolve percentage thread counts.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Queue the calling thread works for, or `None` if it is not a worker.
    #[must_use]
    pub fn current_taskq(&self) -> Option<Taskq> {
        self.registry.current()
    }

    /// Queue `thread` works for.
    #[must_use]
    pub fn taskq_of(&self, thread: ThreadId) -> Option<Taskq> {
        self.registry.lookup(thread)
    }

    pub(crate) const fn registry(&self) -> &AffiliationRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for TaskqContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskqContext")
            .field("capacity", &self.allocator.capacity())
            .field("in_use", &self.allocator.in_use())
            .field("parallelism", &self.parallelism)
            .field("workers", &self.registry.len())
            .finish()
    }
}
