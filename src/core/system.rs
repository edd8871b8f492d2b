//! General-purpose system queues.

use std::sync::Arc;

use tracing::info;

use super::context::TaskqContext;
use super::taskq::Taskq;
use super::{AppResult, TaskqError};
use crate::config::{ContextConfig, SystemConfig, TaskqConfig};

/// Name of the general-purpose queue.
pub const SYSTEM_TASKQ: &str = "system_taskq";

/// Name of the queue meant for delayed work.
pub const SYSTEM_DELAY_TASKQ: &str = "system_delay_taskq";

/// The `system_taskq` / `system_delay_taskq` pair.
///
/// Initialize once before use and call [`fini`](Self::fini) at teardown.
/// Hand the value to whatever needs it; nothing here is global.
#[derive(Debug)]
pub struct SystemTaskqs {
    ctx: Arc<TaskqContext>,
    system: Taskq,
    system_delay: Taskq,
}

impl SystemTaskqs {
    /// Create both system queues in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::InvalidConfig` for an invalid configuration and
    /// `TaskqError::Spawn` if threads cannot be started.
    pub fn init(ctx: &Arc<TaskqContext>, config: &SystemConfig) -> Result<Self, TaskqError> {
        config.validate().map_err(TaskqError::InvalidConfig)?;

        let system = Taskq::create(
            ctx,
            &TaskqConfig::new(SYSTEM_TASKQ).with_thread_count(config.system_threads),
        )?;
        let system_delay = match Taskq::create(
            ctx,
            &TaskqConfig::new(SYSTEM_DELAY_TASKQ).with_thread_count(config.delay_threads),
        ) {
            Ok(tq) => tq,
            Err(err) => {
                let _ = system.destroy();
                return Err(err);
            }
        };

        info!(
            system_threads = system.thread_count(),
            delay_threads = system_delay.thread_count(),
            "System task queues initialized"
        );
        Ok(Self {
            ctx: Arc::clone(ctx),
            system,
            system_delay,
        })
    }

    /// Build a context from the environment and start the system queues with
    /// default thread counts.
    ///
    /// # Errors
    ///
    /// Fails if the environment holds an invalid context configuration or the
    /// queues cannot be created.
    pub fn from_env() -> AppResult<Self> {
        let ctx = TaskqContext::new(&ContextConfig::from_env()?)?;
        Ok(Self::init(&ctx, &SystemConfig::default())?)
    }

    /// Context both queues were created from.
    #[must_use]
    pub const fn context(&self) -> &Arc<TaskqContext> {
        &self.ctx
    }

    /// `system_taskq`.
    #[must_use]
    pub const fn system(&self) -> &Taskq {
        &self.system
    }

    /// `system_delay_taskq`.
    #[must_use]
    pub const fn system_delay(&self) -> &Taskq {
        &self.system_delay
    }

    /// Destroy both queues.
    ///
    /// # Errors
    ///
    /// Returns `TaskqError::WorkerContext` when called from a worker of
    /// either queue.
    pub fn fini(self) -> Result<(), TaskqError> {
        self.system_delay.destroy()?;
        self.system.destroy()?;
        info!("System task queues finalized");
        Ok(())
    }
}
