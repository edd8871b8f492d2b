//! Thread queue: a named set of worker threads draining a private pending list.
//!
//! # Design Principles
//!
//! - **No polling**: workers and drainers block on `parking_lot` condition variables
//! - **Ownership moves with the job**: a [`Job`] is either run by a worker or
//!   dropped by whoever removed it; nothing else can observe it
//! - **Run-out on shutdown**: jobs already pending when the queue stops are
//!   still executed before the workers exit

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::timer::{TimerCancel, TimerToken, TimerWheel};
use super::{Job, JobId, JobPriority, PendingQueue, PRIORITY_DEFAULT};
use crate::core::TaskqError;

/// Callback run on a worker thread.
pub type ThreadHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Which point of a worker's life a callback is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCallback {
    /// Runs on the worker before it takes its first job.
    Init,
    /// Runs on the worker after it has taken its last job.
    Shutdown,
}

/// What `enqueue` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The job was added to the pending list.
    Queued,
    /// A job with the same id was already pending; its closure was replaced
    /// and its place in line kept.
    Coalesced,
}

/// Point-in-time sizes of a thread queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Jobs waiting for a worker.
    pub pending: usize,
    /// Jobs currently executing.
    pub running: usize,
    /// Delayed jobs whose timer has not fired.
    pub armed: usize,
    /// Live worker threads.
    pub workers: usize,
}

struct QueueState {
    pending: PendingQueue,
    running: HashMap<JobId, usize>,
    running_total: usize,
    armed: HashSet<JobId>,
    accepting: bool,
    exiting: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running_total == 0 && self.armed.is_empty()
    }

    fn holds(&self, id: JobId) -> bool {
        self.pending.contains(id) || self.running.contains_key(&id) || self.armed.contains(&id)
    }
}

struct QueueShared {
    name: String,
    state: Mutex<QueueState>,
    /// Signaled when a job is pending or the workers must exit.
    work_ready: Condvar,
    /// Signaled whenever a job leaves the queue (run, removed or disarmed).
    progress: Condvar,
    members: RwLock<HashSet<ThreadId>>,
    panicked_jobs: AtomicU64,
}

impl QueueShared {
    /// Timer-thread side of the fire/cancel claim.
    fn fire(&self, token: &TimerToken) {
        let Some(job) = token.claim_fire() else {
            return;
        };
        let mut state = self.state.lock();
        state.armed.remove(&token.id());
        let replaced = state.pending.push(token.id(), PRIORITY_DEFAULT, job);
        token.finish_fire();
        drop(state);
        drop(replaced);
        self.work_ready.notify_one();
        debug!(queue = %self.name, job = %token.id(), "Timer fired");
    }
}

/// Executor owning a fixed pool of worker threads and one timer thread.
pub struct ThreadQueue {
    shared: Arc<QueueShared>,
    init_hook: Option<ThreadHook>,
    shutdown_hook: Option<ThreadHook>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer: OnceLock<TimerWheel>,
    shut_down: AtomicBool,
}

impl ThreadQueue {
    /// Create a queue with no threads. Call [`start_threads`](Self::start_threads)
    /// once callbacks are attached.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name: name.into(),
                state: Mutex::new(QueueState {
                    pending: PendingQueue::new(),
                    running: HashMap::new(),
                    running_total: 0,
                    armed: HashSet::new(),
                    accepting: true,
                    exiting: false,
                }),
                work_ready: Condvar::new(),
                progress: Condvar::new(),
                members: RwLock::new(HashSet::new()),
                panicked_jobs: AtomicU64::new(0),
            }),
            init_hook: None,
            shutdown_hook: None,
            workers: Mutex::new(Vec::new()),
            timer: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Attach a worker lifecycle callback. Only threads started afterwards run it.
    pub fn set_callback(&mut self, kind: ThreadCallback, hook: ThreadHook) {
        match kind {
            ThreadCallback::Init => self.init_hook = Some(hook),
            ThreadCallback::Shutdown => self.shutdown_hook = Some(hook),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn `count` worker threads and the timer thread.
    ///
    /// Workers count as members from the moment they are spawned.
    /// `priority` is recorded in the worker logs only; the standard library
    /// offers no portable way to apply it.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::Spawn` if a thread cannot be created. Threads that
    /// did start keep running until [`shutdown`](Self::shutdown).
    pub fn start_threads(
        &self,
        count: usize,
        priority: i32,
        stack_size: Option<usize>,
    ) -> Result<(), TaskqError> {
        let shared = Arc::clone(&self.shared);
        let timer = TimerWheel::spawn(&self.shared.name, move |token| shared.fire(&token))?;
        if self.timer.set(timer).is_err() {
            warn!(queue = %self.shared.name, "Threads already started");
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for worker_id in 0..count {
            let worker = spawn_worker(
                worker_id,
                Arc::clone(&self.shared),
                self.init_hook.clone(),
                self.shutdown_hook.clone(),
                priority,
                stack_size,
            )?;
            self.shared.members.write().insert(worker.thread().id());
            workers.push(worker);
        }

        info!(
            queue = %self.shared.name,
            worker_count = count,
            priority = priority,
            "Thread queue started"
        );
        Ok(())
    }

    /// Queue `job` at `priority`.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::ShutDown` once the queue stopped accepting work;
    /// the job is dropped.
    pub fn enqueue(
        &self,
        id: JobId,
        priority: JobPriority,
        job: Job,
    ) -> Result<Enqueued, TaskqError> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            drop(state);
            drop(job);
            return Err(TaskqError::ShutDown);
        }
        let replaced = state.pending.push(id, priority, job);
        drop(state);

        if let Some(old) = replaced {
            drop(old);
            return Ok(Enqueued::Coalesced);
        }
        self.shared.work_ready.notify_one();
        Ok(Enqueued::Queued)
    }

    /// Arm `token` to move its job onto the pending list once `deadline` has passed.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::ShutDown` if the queue no longer accepts work or
    /// the timer thread is gone. The token is disarmed and its job dropped.
    pub fn enqueue_after(
        &self,
        token: &Arc<TimerToken>,
        deadline: Instant,
    ) -> Result<(), TaskqError> {
        {
            let mut state = self.shared.state.lock();
            if state.accepting {
                state.armed.insert(token.id());
            } else {
                drop(state);
                let _ = token.claim_cancel();
                return Err(TaskqError::ShutDown);
            }
        }

        let armed = self
            .timer
            .get()
            .ok_or(TaskqError::ShutDown)
            .and_then(|timer| timer.arm(Arc::clone(token), deadline));
        if armed.is_err() {
            self.cancel_timer(token);
        }
        armed
    }

    /// Remove a pending job. Returns `false` if it is running, done or unknown.
    ///
    /// The removed job is dropped, never run.
    pub fn cancel_enqueued(&self, id: JobId) -> bool {
        let removed = self.shared.state.lock().pending.remove(id);
        match removed {
            Some(job) => {
                drop(job);
                self.shared.progress.notify_all();
                true
            }
            None => false,
        }
    }

    /// Disarm a delayed job. Only [`TimerCancel::Disarmed`] means this call
    /// took the job (and dropped it).
    pub fn cancel_timer(&self, token: &TimerToken) -> TimerCancel {
        match token.claim_cancel() {
            Ok(job) => {
                self.shared.state.lock().armed.remove(&token.id());
                drop(job);
                self.shared.progress.notify_all();
                TimerCancel::Disarmed
            }
            Err(outcome) => outcome,
        }
    }

    /// Whether `id` is executing on a worker right now.
    #[must_use]
    pub fn is_running(&self, id: JobId) -> bool {
        self.shared.state.lock().running.contains_key(&id)
    }

    /// Whether `id` is waiting on the pending list.
    #[must_use]
    pub fn is_queued(&self, id: JobId) -> bool {
        self.shared.state.lock().pending.contains(id)
    }

    /// Block until `id` is neither pending, running nor armed.
    pub fn drain_one(&self, id: JobId) {
        let mut state = self.shared.state.lock();
        while state.holds(id) {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Block until nothing is pending, running or armed.
    pub fn drain_all(&self) {
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Whether `thread` is one of this queue's workers.
    #[must_use]
    pub fn is_member(&self, thread: ThreadId) -> bool {
        self.shared.members.read().contains(&thread)
    }

    /// Current queue sizes.
    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        let state = self.shared.state.lock();
        QueueCounts {
            pending: state.pending.len(),
            running: state.running_total,
            armed: state.armed.len(),
            workers: self.shared.members.read().len(),
        }
    }

    /// Jobs that panicked since the queue started.
    #[must_use]
    pub fn panicked_jobs(&self) -> u64 {
        self.shared.panicked_jobs.load(Ordering::Relaxed)
    }

    /// Stop accepting work, disarm unfired timers, run out the pending list
    /// and join every thread. Later calls return immediately.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(queue = %self.shared.name, "Shutting down thread queue");

        self.shared.state.lock().accepting = false;

        if let Some(timer) = self.timer.get() {
            let leftover = timer.shutdown();
            let disarmed = leftover
                .iter()
                .filter(|token| self.cancel_timer(token) == TimerCancel::Disarmed)
                .count();
            if disarmed > 0 {
                debug!(queue = %self.shared.name, disarmed = disarmed, "Disarmed unfired timers");
            }
        }

        self.shared.state.lock().exiting = true;
        self.shared.work_ready.notify_all();

        let current = thread::current().id();
        let mut workers = self.workers.lock();
        let worker_count = workers.len();

        for (idx, worker) in workers.drain(..).enumerate() {
            if worker.thread().id() == current {
                warn!(worker_id = idx, "Shutdown issued from a worker; not joining itself");
                continue;
            }
            match worker.join() {
                Ok(()) => debug!(worker_id = idx, "Worker joined successfully"),
                Err(_) => warn!(worker_id = idx, "Worker panicked"),
            }
        }

        self.shared.progress.notify_all();
        info!(queue = %self.shared.name, worker_count = worker_count, "Thread queue shut down complete");
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        // Signal shutdown but don't join; explicit shutdown() is the graceful path
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            state.exiting = true;
            drop(state);
            self.shared.work_ready.notify_all();
            debug!(queue = %self.shared.name, "ThreadQueue dropped without explicit shutdown - workers will be detached");
        }
    }
}

/// Spawn a worker thread.
fn spawn_worker(
    worker_id: usize,
    shared: Arc<QueueShared>,
    init_hook: Option<ThreadHook>,
    shutdown_hook: Option<ThreadHook>,
    priority: i32,
    stack_size: Option<usize>,
) -> Result<JoinHandle<()>, TaskqError> {
    let mut builder = thread::Builder::new().name(format!("{}-{worker_id}", shared.name));
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }

    let handle = builder.spawn(move || {
        let thread_id = thread::current().id();
        shared.members.write().insert(thread_id);
        if let Some(hook) = &init_hook {
            hook();
        }
        debug!(queue = %shared.name, worker_id = worker_id, priority = priority, "Worker thread started");

        loop {
            let next = {
                let mut state = shared.state.lock();
                loop {
                    if let Some((id, job)) = state.pending.pop() {
                        *state.running.entry(id).or_insert(0) += 1;
                        state.running_total += 1;
                        break Some((id, job));
                    }
                    if state.exiting {
                        break None;
                    }
                    shared.work_ready.wait(&mut state);
                }
            };

            let Some((id, job)) = next else {
                break;
            };

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                shared.panicked_jobs.fetch_add(1, Ordering::Relaxed);
                error!(queue = %shared.name, worker_id = worker_id, job = %id, "Job panicked");
            }

            {
                let mut state = shared.state.lock();
                if let Some(count) = state.running.get_mut(&id) {
                    *count -= 1;
                    if *count == 0 {
                        state.running.remove(&id);
                    }
                }
                state.running_total -= 1;
            }
            shared.progress.notify_all();
        }

        if let Some(hook) = &shutdown_hook {
            hook();
        }
        shared.members.write().remove(&thread_id);
        shared.progress.notify_all();
        debug!(queue = %shared.name, worker_id = worker_id, "Worker thread exiting");
    })?;

    Ok(handle)
}
