//! Configuration models for task queues, contexts and system queues.

pub mod taskq;

pub use taskq::{
    ContextConfig, SystemConfig, TaskqConfig, TaskqSetConfig, ThreadCount, DEFAULT_MAX_ENTRIES,
    ENV_MAX_ENTRIES, ENV_PARALLELISM,
};
