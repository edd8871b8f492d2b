//! Task queues, entries, and the state they share.

pub mod affiliation;
pub mod allocator;
pub mod context;
pub mod entry;
pub mod error;
pub mod system;
pub mod taskq;

pub use affiliation::AffiliationRegistry;
pub use allocator::{EntryAllocator, EntryInfo, EntryRecord};
pub use context::TaskqContext;
pub use entry::{CancelOutcome, DispatchFlags, EntryKind, TaskFn, TaskqEnt, TaskqId};
pub use error::{AppResult, TaskqError};
pub use system::{SystemTaskqs, SYSTEM_DELAY_TASKQ, SYSTEM_TASKQ};
pub use taskq::{Taskq, TaskqStats, FAR_FUTURE};
