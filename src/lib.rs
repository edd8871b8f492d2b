//! # Prometheus Taskq
//!
//! Named pools of worker threads that run dispatched tasks, in the style of a
//! kernel task queue.
//!
//! A [`Taskq`](core::Taskq) owns a fixed set of worker threads. Callers hand it
//! a function and an argument; a worker runs the function once, and the caller
//! receives a [`TaskqId`](core::TaskqId) it can later cancel or wait on.
//!
//! ## Key Features
//!
//! - **Immediate, front and delayed dispatch**: front-flagged tasks run before
//!   ordinary pending tasks; delayed tasks are armed on a timer and join the
//!   pending list once their deadline passes
//! - **Race-free cancellation**: a task is either cancelled before it starts or
//!   runs to completion, never both, and its entry is released exactly once
//! - **Caller-owned entries**: [`TaskqEnt`](core::TaskqEnt) dispatches without
//!   allocation and can be re-dispatched after it completes
//! - **Stale-handle detection**: handles carry a generation, so a handle whose
//!   entry has been recycled is recognised rather than acting on the new task
//! - **Thread affiliation**: a worker can ask which queue it belongs to
//! - **Percentage thread counts**: `with_cpu_percent(75)` sizes a queue by the
//!   machine's parallelism
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_taskq::config::{ContextConfig, TaskqConfig};
//! use prometheus_taskq::core::{DispatchFlags, Taskq, TaskqContext};
//! use std::time::Duration;
//!
//! let ctx = TaskqContext::new(&ContextConfig::default())?;
//! let tq = Taskq::create(&ctx, &TaskqConfig::new("io_flush").with_threads(4))?;
//!
//! let id = tq.dispatch(|path: String| flush(&path), "/var/log/app".into(), DispatchFlags::SLEEP)?;
//! let later = tq.dispatch_after(|n: u32| retry(n), 3, DispatchFlags::SLEEP, Duration::from_secs(5))?;
//!
//! tq.cancel_id(Some(later))?;
//! tq.wait_id(Some(id))?;
//! tq.destroy()?;
//! ```
//!
//! For complete examples, see `tests/taskq_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task queues, entries, allocation and thread affiliation.
pub mod core;
/// Configuration models for queues, contexts and system queues.
pub mod config;
/// Builders to construct task queues from configuration.
pub mod builders;
/// Worker threads, pending lists and timers behind each queue.
pub mod executor;
/// Shared utilities.
pub mod util;

pub use crate::core::{
    CancelOutcome, DispatchFlags, SystemTaskqs, Taskq, TaskqContext, TaskqEnt, TaskqError,
    TaskqId,
};
