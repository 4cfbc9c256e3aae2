//! Poll workflows: the workers that drive each poll through its lifecycle.
//!
//! ```text
//! ChangeNotifier --start--> [decision list] --DeciderWorker--> timer / activate / expire / done
//!                                ^                                   |
//!                                +------ ActivityWorker <-- [activity list]
//! ```
//!
//! A decision task loads the poll, asks the engine what to do, and enqueues
//! the follow-up. Activity tasks perform one side-effecting step and hand
//! control back with a fresh decision task. Retryable failures go back on the
//! queue with backoff; anything else closes the workflow as failed.

pub mod activity;
mod changes;
mod decider;
mod pool;

pub use activity::{activate_poll, deactivate_poll, ActivityWorker};
pub use changes::ChangeNotifier;
pub use decider::DeciderWorker;
pub use pool::WorkerPool;

use std::sync::Arc;

use tracing::{error, warn};

use crate::clock::Clock;
use crate::error::CoreError;
use crate::queue::{RetryOutcome, Task, TaskQueue, WorkflowOutcome};
use crate::repository::PollRepository;

/// Everything a worker needs, shared by all workers in a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub repo: PollRepository,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
}

/// Put a failed task back with backoff, or fail its workflow for good.
async fn settle_failure(queue: &dyn TaskQueue, task: &Task, err: CoreError) {
    let poll_id = task.workflow_id.as_str();
    if err.is_retryable() {
        match queue.retry(&task.lease_token, &err.to_string()).await {
            Ok(RetryOutcome::Scheduled { attempt, at }) => {
                warn!(poll_id, task = %task.kind, attempt, retry_at = %at, error = %err, "task failed, will retry");
                return;
            }
            Ok(RetryOutcome::Exhausted { attempts }) => {
                let reason = format!("{} failed after {attempts} attempts: {err}", task.kind);
                close_failed(queue, poll_id, reason).await;
                return;
            }
            Err(retry_err) => {
                warn!(poll_id, task = %task.kind, error = %retry_err, "could not reschedule task; lease will expire");
                return;
            }
        }
    }
    close_failed(queue, poll_id, format!("{} failed: {err}", task.kind)).await;
}

async fn close_failed(queue: &dyn TaskQueue, poll_id: &str, reason: String) {
    error!(poll_id, reason = %reason, "workflow failed");
    if let Err(e) = queue
        .close_workflow(poll_id, WorkflowOutcome::Failed(reason))
        .await
    {
        error!(poll_id, error = %e, "could not record workflow failure");
    }
}
