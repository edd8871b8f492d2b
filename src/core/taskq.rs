//! Task queue handle: a named pool of worker threads running dispatched tasks.
//!
//! # Entry ownership
//!
//! A pool-owned entry is released by whoever holds its job last:
//!
//! - the worker, after the function returns (or unwinds)
//! - `cancel_id`, after removing the job from the pending list
//! - `cancel_id`, after disarming the timer of a delayed entry
//! - `destroy`, for delayed entries whose timer never fired
//!
//! The job is a single box and each of those paths obtains it through one
//! exclusive operation (pending-list removal under the queue lock, or the
//! timer token compare-exchange), so no entry can be released twice.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_taskq::config::{ContextConfig, TaskqConfig};
//! use prometheus_taskq::core::{DispatchFlags, Taskq, TaskqContext};
//!
//! let ctx = TaskqContext::new(&ContextConfig::default())?;
//! let tq = Taskq::create(&ctx, &TaskqConfig::new("zio_write").with_cpu_percent(75))?;
//!
//! let id = tq.dispatch(|block: u64| flush(block), 42, DispatchFlags::SLEEP)?;
//! tq.wait_id(Some(id))?;
//! tq.destroy()?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use super::allocator::{EntryGuard, EntryRecord};
use super::context::TaskqContext;
use super::entry::{CancelOutcome, DispatchFlags, EntryKind, TaskqEnt, TaskqId};
use super::TaskqError;
use crate::config::TaskqConfig;
use crate::executor::{Enqueued, Job, ThreadCallback, ThreadQueue, TimerCancel, TimerToken};

/// Longest delay `dispatch_after` arms a timer for; larger delays are clamped.
pub const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Statistics about a queue.
#[derive(Debug, Clone, Default)]
pub struct TaskqStats {
    /// Number of worker threads.
    pub threads: usize,
    /// Successful dispatches of every kind.
    pub dispatched: u64,
    /// Task functions that returned.
    pub completed: u64,
    /// Cancellations that prevented a task from running.
    pub cancelled: u64,
    /// Dispatches refused for lack of a free entry.
    pub allocation_failures: u64,
    /// Task functions that panicked.
    pub panicked: u64,
    /// Tasks waiting for a worker.
    pub pending: usize,
    /// Tasks executing now.
    pub running: usize,
    /// Delayed tasks whose deadline has not passed.
    pub armed: usize,
}

/// Internal counters for queue statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct TaskqCounters {
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
    pub allocation_failures: AtomicU64,
}

pub(crate) struct TaskqInner {
    uid: Uuid,
    name: String,
    threads: usize,
    priority: i32,
    queue: ThreadQueue,
    ctx: Arc<TaskqContext>,
    counters: Arc<TaskqCounters>,
}

/// Handle to a task queue.
///
/// Cloning is cheap and every clone drives the same queue. The queue stops
/// when [`destroy`](Self::destroy) is called; no dispatch, cancel or wait may
/// race with that call.
#[derive(Clone)]
pub struct Taskq {
    inner: Arc<TaskqInner>,
}

impl Taskq {
    /// Create a queue and start its worker threads.
    ///
    /// A percentage thread count is resolved against the context's
    /// parallelism, floored, never below one thread.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::InvalidConfig` for an invalid configuration and
    /// `TaskqError::Spawn` if the threads cannot be started.
    pub fn create(ctx: &Arc<TaskqContext>, config: &TaskqConfig) -> Result<Self, TaskqError> {
        config.validate().map_err(TaskqError::InvalidConfig)?;
        let threads = config.threads.resolve(ctx.parallelism());

        let inner = Arc::new_cyclic(|weak: &Weak<TaskqInner>| {
            let mut queue = ThreadQueue::new(config.name.clone());

            let start_ctx = Arc::clone(ctx);
            let start_taskq = weak.clone();
            queue.set_callback(
                ThreadCallback::Init,
                Arc::new(move || {
                    start_ctx
                        .registry()
                        .register(thread::current().id(), start_taskq.clone());
                }),
            );
            let stop_ctx = Arc::clone(ctx);
            queue.set_callback(
                ThreadCallback::Shutdown,
                Arc::new(move || stop_ctx.registry().unregister(thread::current().id())),
            );

            TaskqInner {
                uid: Uuid::new_v4(),
                name: config.name.clone(),
                threads,
                priority: config.priority,
                queue,
                ctx: Arc::clone(ctx),
                counters: Arc::new(TaskqCounters::default()),
            }
        });

        if let Err(err) = inner
            .queue
            .start_threads(threads, config.priority, config.stack_size)
        {
            inner.queue.shutdown();
            return Err(err);
        }

        info!(
            queue = %config.name,
            threads = threads,
            priority = config.priority,
            "Task queue created"
        );

        Ok(Self { inner })
    }

    pub(crate) const fn from_inner(inner: Arc<TaskqInner>) -> Self {
        Self { inner }
    }

    /// Stop accepting work, disarm delayed tasks that have not fired, run the
    /// tasks already pending and join every worker. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::WorkerContext` when called from one of this
    /// queue's own workers.
    pub fn destroy(&self) -> Result<(), TaskqError> {
        if self.is_worker_thread() {
            return Err(TaskqError::WorkerContext);
        }
        self.inner.queue.shutdown();
        info!(queue = %self.inner.name, "Task queue destroyed");
        Ok(())
    }

    /// Dispatch `func(arg)` to run as soon as a worker is free.
    ///
    /// # Errors
    ///
    /// - `TaskqError::AllocationExhausted` if no entry is free and `flags`
    ///   do not allow sleeping (the "none" handle)
    /// - `TaskqError::ShutDown` if the queue has been destroyed
    pub fn dispatch<A, F>(&self, func: F, arg: A, flags: DispatchFlags) -> Result<TaskqId, TaskqError>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let record = EntryRecord::new(
            EntryKind::Normal,
            self.inner.uid,
            Box::new(move || func(arg)),
        );
        let id = self.allocate(flags, record)?;

        self.inner
            .queue
            .enqueue(id.job_id(), flags.priority(), self.entry_job(id))?;
        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        debug!(
            queue = %self.inner.name,
            task_id = %id,
            front = flags.is_front(),
            "Task dispatched"
        );
        Ok(id)
    }

    /// Dispatch `func(arg)` to run once `deadline` has passed.
    ///
    /// A deadline that is not in the future is not an error: the task is
    /// dispatched immediately, exactly like [`dispatch`](Self::dispatch).
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub fn dispatch_delay<A, F>(
        &self,
        func: F,
        arg: A,
        flags: DispatchFlags,
        deadline: Instant,
    ) -> Result<TaskqId, TaskqError>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            return self.dispatch(func, arg, flags);
        }

        let record = EntryRecord::new(
            EntryKind::Timeout { deadline },
            self.inner.uid,
            Box::new(move || func(arg)),
        );
        let id = self.allocate(flags, record)?;

        let token = TimerToken::new(id.job_id(), self.entry_job(id));
        self.inner
            .ctx
            .allocator()
            .attach_timer(id, Arc::clone(&token));
        self.inner.queue.enqueue_after(&token, deadline)?;
        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        debug!(
            queue = %self.inner.name,
            task_id = %id,
            delay_ms = timeout.as_millis(),
            "Delayed task armed"
        );
        Ok(id)
    }

    /// Dispatch `func(arg)` to run after `delay`.
    ///
    /// A delay too large to represent as an `Instant` (`Duration::MAX`, say)
    /// is clamped to [`FAR_FUTURE`] from now.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch), plus `TaskqError::InvalidConfig`
    /// if not even the clamped deadline is representable.
    pub fn dispatch_after<A, F>(
        &self,
        func: F,
        arg: A,
        flags: DispatchFlags,
        delay: Duration,
    ) -> Result<TaskqId, TaskqError>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .ok_or_else(|| TaskqError::InvalidConfig(format!("delay {delay:?} out of range")))?;
        self.dispatch_delay(func, arg, flags, deadline)
    }

    /// Dispatch `func(arg)` through a caller-owned entry. No allocation takes
    /// place and the entry is never freed by the queue.
    ///
    /// If `ent` is still waiting on this queue the queued function is replaced
    /// and the entry keeps its place.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::ShutDown` if the queue has been destroyed.
    pub fn dispatch_ent<A, F>(
        &self,
        func: F,
        arg: A,
        flags: DispatchFlags,
        ent: &TaskqEnt,
    ) -> Result<(), TaskqError>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let in_flight = ent.begin_flight();
        let counters = Arc::clone(&self.inner.counters);
        let job: Job = Box::new(move || {
            func(arg);
            in_flight.complete();
            counters.completed.fetch_add(1, Ordering::Relaxed);
        });

        let outcome = self.inner.queue.enqueue(ent.job_id(), flags.priority(), job)?;
        if outcome == Enqueued::Coalesced {
            debug!(queue = %self.inner.name, job = %ent.job_id(), "Entry already pending; function replaced");
            return Ok(());
        }
        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.inner.name, job = %ent.job_id(), "Caller-owned entry dispatched");
        Ok(())
    }

    /// Try to stop a task from running.
    ///
    /// Never waits for a running task. `None` is accepted and does nothing.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::InvalidHandle` if `id` was not issued by this queue.
    pub fn cancel_id(&self, id: Option<TaskqId>) -> Result<CancelOutcome, TaskqError> {
        let Some(id) = id else {
            return Ok(CancelOutcome::NotFound);
        };
        let Some(info) = self.inner.ctx.allocator().inspect(id)? else {
            return Ok(CancelOutcome::NotFound);
        };
        if info.owner != self.inner.uid {
            return Err(TaskqError::InvalidHandle);
        }

        let outcome = match (info.kind, info.timer) {
            (EntryKind::Timeout { .. }, Some(token)) => match self.inner.queue.cancel_timer(&token) {
                TimerCancel::Disarmed => CancelOutcome::Cancelled,
                TimerCancel::Firing => CancelOutcome::AlreadyStarted,
                TimerCancel::Fired | TimerCancel::Inactive => self.cancel_pending(id),
            },
            _ => self.cancel_pending(id),
        };

        if outcome == CancelOutcome::Cancelled {
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        debug!(queue = %self.inner.name, task_id = %id, outcome = ?outcome, "Cancel requested");
        Ok(outcome)
    }

    /// Block until every task dispatched so far, delayed ones included, has
    /// completed.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::WorkerContext` when called from one of this
    /// queue's own workers, which would wait on itself.
    pub fn wait(&self) -> Result<(), TaskqError> {
        if self.is_worker_thread() {
            return Err(TaskqError::WorkerContext);
        }
        self.inner.queue.drain_all();
        Ok(())
    }

    /// Block until the task behind `id` has completed or been cancelled.
    /// Returns at once for `None` and for handles whose entry is gone.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::InvalidHandle` if `id` was not issued by this queue.
    pub fn wait_id(&self, id: Option<TaskqId>) -> Result<(), TaskqError> {
        let Some(id) = id else {
            return Ok(());
        };
        let Some(info) = self.inner.ctx.allocator().inspect(id)? else {
            return Ok(());
        };
        if info.owner != self.inner.uid {
            return Err(TaskqError::InvalidHandle);
        }
        self.inner.queue.drain_one(id.job_id());
        Ok(())
    }

    /// Block until `id` and everything dispatched before it have completed.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_outstanding(&self, _id: Option<TaskqId>) -> Result<(), TaskqError> {
        self.wait()
    }

    /// Block until a caller-owned entry is no longer queued or running here.
    pub fn wait_ent(&self, ent: &TaskqEnt) {
        self.inner.queue.drain_one(ent.job_id());
    }

    /// Whether `thread` is one of this queue's workers.
    #[must_use]
    pub fn member(&self, thread: ThreadId) -> bool {
        self.inner.queue.is_member(thread)
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of worker threads the queue was created with.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.threads
    }

    /// Requested worker priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    /// Identity of this queue; handles remember it.
    #[must_use]
    pub fn uid(&self) -> Uuid {
        self.inner.uid
    }

    /// Context this queue was created from.
    #[must_use]
    pub fn context(&self) -> &Arc<TaskqContext> {
        &self.inner.ctx
    }

    /// Whether two handles drive the same queue.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get current queue statistics.
    #[must_use]
    pub fn stats(&self) -> TaskqStats {
        let counts = self.inner.queue.counts();
        let counters = &self.inner.counters;
        TaskqStats {
            threads: self.inner.threads,
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            allocation_failures: counters.allocation_failures.load(Ordering::Relaxed),
            panicked: self.inner.queue.panicked_jobs(),
            pending: counts.pending,
            running: counts.running,
            armed: counts.armed,
        }
    }

    /// Asynchronous [`wait`](Self::wait); the blocking drain runs on tokio's
    /// blocking thread pool.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait), plus `TaskqError::Internal` if the
    /// blocking task fails.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self) -> Result<(), TaskqError> {
        let taskq = self.clone();
        tokio::task::spawn_blocking(move || taskq.wait())
            .await
            .map_err(|e| TaskqError::Internal(e.to_string()))?
    }

    /// Asynchronous [`wait_id`](Self::wait_id).
    ///
    /// # Errors
    ///
    /// Same as [`wait_id`](Self::wait_id), plus `TaskqError::Internal` if the
    /// blocking task fails.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_id_async(&self, id: Option<TaskqId>) -> Result<(), TaskqError> {
        let taskq = self.clone();
        tokio::task::spawn_blocking(move || taskq.wait_id(id))
            .await
            .map_err(|e| TaskqError::Internal(e.to_string()))?
    }

    fn allocate(&self, flags: DispatchFlags, record: EntryRecord) -> Result<TaskqId, TaskqError> {
        self.inner
            .ctx
            .allocator()
            .allocate(flags.may_sleep(), record)
            .inspect_err(|_| {
                self.inner
                    .counters
                    .allocation_failures
                    .fetch_add(1, Ordering::Relaxed);
            })
    }

    /// Job that runs a pool-owned entry and releases it afterwards.
    fn entry_job(&self, id: TaskqId) -> Job {
        let guard = EntryGuard::new(Arc::clone(self.inner.ctx.allocator()), id);
        let counters = Arc::clone(&self.inner.counters);
        Box::new(move || {
            guard.run();
            counters.completed.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn cancel_pending(&self, id: TaskqId) -> CancelOutcome {
        if self.inner.queue.cancel_enqueued(id.job_id()) {
            CancelOutcome::Cancelled
        } else if self.inner.queue.is_running(id.job_id()) {
            CancelOutcome::AlreadyStarted
        } else {
            CancelOutcome::NotFound
        }
    }

    fn is_worker_thread(&self) -> bool {
        self.inner.queue.is_member(thread::current().id())
    }
}

impl std::fmt::Debug for Taskq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Taskq")
            .field("name", &self.inner.name)
            .field("uid", &self.inner.uid)
            .field("threads", &self.inner.threads)
            .finish_non_exhaustive()
    }
}
