//! Builders to construct task queues from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TaskqSetConfig;
use crate::core::{Taskq, TaskqContext, TaskqError};

/// Build every queue of `cfg` in `ctx`, keyed by name.
///
/// If one queue fails to start, the queues already created are destroyed
/// before the error is returned.
///
/// # Errors
///
/// Returns `TaskqError::InvalidConfig` if `cfg` is invalid, or the error of
/// the first queue that could not be created.
pub fn build_taskqs(
    ctx: &Arc<TaskqContext>,
    cfg: &TaskqSetConfig,
) -> Result<HashMap<String, Taskq>, TaskqError> {
    cfg.validate()
        .map_err(|e| TaskqError::InvalidConfig(format!("config invalid: {e}")))?;

    let mut queues = HashMap::new();
    for queue_cfg in &cfg.queues {
        match Taskq::create(ctx, queue_cfg) {
            Ok(tq) => {
                queues.insert(queue_cfg.name.clone(), tq);
            }
            Err(err) => {
                for tq in queues.values() {
                    let _ = tq.destroy();
                }
                return Err(err);
            }
        }
    }

    Ok(queues)
}
