//! Error types for task queue operations.

use thiserror::Error;

/// Errors produced by task queues and their collaborators.
#[derive(Debug, Error)]
pub enum TaskqError {
    /// A non-blocking dispatch found no free entry. Expected under load; the
    /// caller decides whether to drop the work or retry with a sleeping dispatch.
    #[error("no task entry available")]
    AllocationExhausted,
    /// The handle does not belong to this queue or allocator.
    #[error("invalid task handle")]
    InvalidHandle,
    /// The queue has been destroyed or is shutting down.
    #[error("task queue has been shut down")]
    ShutDown,
    /// The operation would make a worker wait on its own queue.
    #[error("operation not permitted from a worker of this queue")]
    WorkerContext,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker or timer thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// Internal error (helper task failed, thread panicked while waiting).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
