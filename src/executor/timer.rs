//! One-shot timers for delayed dispatch.
//!
//! Every delayed job lives in a [`TimerToken`] until exactly one of two parties
//! claims it: the timer thread when the deadline passes, or a canceller. The
//! claim is a single compare-exchange on the token state, and the job box moves
//! to whoever wins.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Job, JobId};
use crate::core::TaskqError;

const ARMED: u8 = 0;
const FIRING: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

/// Result of trying to disarm a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCancel {
    /// Disarmed before firing. The canceller now owns the job.
    Disarmed,
    /// The timer thread has claimed the token and is handing the job to the
    /// pending list. The fire path owns the job.
    Firing,
    /// The job has already been handed to the pending list.
    Fired,
    /// The token was cancelled earlier.
    Inactive,
}

/// A one-shot timer registration carrying the delayed job.
pub struct TimerToken {
    id: JobId,
    state: AtomicU8,
    job: Mutex<Option<Job>>,
}

impl TimerToken {
    /// Wrap `job` in an armed token.
    pub fn new(id: JobId, job: Job) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(ARMED),
            job: Mutex::new(Some(job)),
        })
    }

    /// Id of the job carried by this token.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Whether nobody has claimed the token yet.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    /// Claim the token for firing. Returns the job only if the timer won.
    pub(crate) fn claim_fire(&self) -> Option<Job> {
        self.state
            .compare_exchange(ARMED, FIRING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.job.lock().take()
    }

    /// Record that the fired job has reached the pending list.
    pub(crate) fn finish_fire(&self) {
        self.state.store(FIRED, Ordering::Release);
    }

    /// Claim the token for cancellation.
    ///
    /// On success the job is returned and the caller decides when to drop it.
    /// On failure the returned outcome names who owns the job instead.
    pub(crate) fn claim_cancel(&self) -> Result<Option<Job>, TimerCancel> {
        match self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(self.job.lock().take()),
            Err(FIRING) => Err(TimerCancel::Firing),
            Err(FIRED) => Err(TimerCancel::Fired),
            Err(_) => Err(TimerCancel::Inactive),
        }
    }
}

impl std::fmt::Debug for TimerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerToken")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

enum TimerCommand {
    Arm {
        deadline: Instant,
        token: Arc<TimerToken>,
    },
    Shutdown,
    Abandon,
}

/// Dedicated thread that fires tokens when their deadline passes.
pub struct TimerWheel {
    tx: Sender<TimerCommand>,
    handle: Mutex<Option<JoinHandle<Vec<Arc<TimerToken>>>>>,
}

impl TimerWheel {
    /// Start the timer thread. `on_fire` runs on the timer thread for every
    /// token that is still armed at its deadline.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::Spawn` if the thread cannot be created.
    pub fn spawn<F>(name: &str, on_fire: F) -> Result<Self, TaskqError>
    where
        F: Fn(Arc<TimerToken>) + Send + 'static,
    {
        let (tx, rx) = unbounded::<TimerCommand>();
        let thread_name = format!("{name}-timer");

        let handle = thread::Builder::new().name(thread_name).spawn(move || {
            let mut armed: BTreeMap<(Instant, u64), Arc<TimerToken>> = BTreeMap::new();
            let mut seq = 0_u64;

            let collect = loop {
                let now = Instant::now();
                while let Some(entry) = armed.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let token = entry.remove();
                    if token.is_armed() {
                        on_fire(token);
                    }
                }

                let next_deadline = armed.keys().next().map(|(deadline, _)| *deadline);
                let command = match next_deadline {
                    Some(deadline) => {
                        match rx.recv_deadline(deadline) {
                            Ok(command) => command,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break false,
                        }
                    }
                    None => match rx.recv() {
                        Ok(command) => command,
                        Err(_) => break false,
                    },
                };

                match command {
                    TimerCommand::Arm { deadline, token } => {
                        armed.insert((deadline, seq), token);
                        seq += 1;
                    }
                    TimerCommand::Shutdown => break true,
                    TimerCommand::Abandon => break false,
                }
            };

            let leftover = armed.into_values().filter(|token| token.is_armed());
            if collect {
                // Unfired registrations go back to the owner for disarming
                return leftover.collect::<Vec<_>>();
            }
            for token in leftover {
                if let Ok(job) = token.claim_cancel() {
                    drop(job);
                }
            }
            Vec::<Arc<TimerToken>>::new()
        })?;

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Fire `token` once `deadline` has passed.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::ShutDown` if the timer thread has stopped.
    pub fn arm(&self, token: Arc<TimerToken>, deadline: Instant) -> Result<(), TaskqError> {
        self.tx
            .send(TimerCommand::Arm { deadline, token })
            .map_err(|_| TaskqError::ShutDown)
    }

    /// Stop the timer thread and return every token that never fired.
    pub fn shutdown(&self) -> Vec<Arc<TimerToken>> {
        let Some(handle) = self.handle.lock().take() else {
            return Vec::new();
        };
        let _ = self.tx.send(TimerCommand::Shutdown);
        match handle.join() {
            Ok(leftover) => {
                debug!(leftover = leftover.len(), "Timer thread stopped");
                leftover
            }
            Err(_) => {
                warn!("Timer thread panicked");
                Vec::new()
            }
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        // Don't join here; the thread disarms whatever is left on its own
        if self.handle.lock().is_some() {
            let _ = self.tx.send(TimerCommand::Abandon);
        }
    }
}
