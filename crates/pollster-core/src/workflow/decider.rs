use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{settle_failure, WorkerContext};
use crate::clock::to_chrono;
use crate::engine::{decide, Decision};
use crate::error::{CoreError, Result};
use crate::queue::{NewTask, Task, TaskKind, TaskList, WorkflowOutcome};

/// What a decision produced.
enum Step {
    /// Acknowledge with these follow-up tasks.
    Continue(Vec<NewTask>),
    /// The poll reached its terminal state.
    Finished,
}

/// Claims decision tasks and runs the transition engine on them.
pub struct DeciderWorker {
    name: String,
    ctx: WorkerContext,
}

impl DeciderWorker {
    pub fn new(name: impl Into<String>, ctx: WorkerContext) -> Self {
        Self {
            name: name.into(),
            ctx,
        }
    }

    /// Process decision tasks until `shutdown` fires.
    #[instrument(skip(self, shutdown), fields(worker = %self.name))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("decider started");
        loop {
            match self.ctx.queue.claim(TaskList::Decision, &shutdown).await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim decision task");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("decider stopped");
    }

    /// Handle one claimed task to completion.
    pub async fn process(&self, task: Task) {
        match self.step(&task).await {
            Ok(Step::Continue(follow_ups)) => {
                if let Err(e) = self.ctx.queue.complete(&task.lease_token, follow_ups).await {
                    warn!(poll_id = %task.workflow_id, error = %e, "could not acknowledge decision");
                }
            }
            Ok(Step::Finished) => {
                info!(poll_id = %task.workflow_id, "workflow completed");
                if let Err(e) = self
                    .ctx
                    .queue
                    .close_workflow(&task.workflow_id, WorkflowOutcome::Completed)
                    .await
                {
                    warn!(poll_id = %task.workflow_id, error = %e, "could not close workflow");
                }
            }
            Err(e) => settle_failure(self.ctx.queue.as_ref(), &task, e).await,
        }
    }

    async fn step(&self, task: &Task) -> Result<Step> {
        if task.kind != TaskKind::Decide {
            return Err(CoreError::fatal(
                &task.workflow_id,
                format!("unexpected {} task on the decision list", task.kind),
            ));
        }
        let poll_id = task.workflow_id.as_str();
        let poll = self.ctx.repo.get(poll_id).await?;
        let now = self.ctx.clock.now();
        let plan = decide(&poll, now);

        if let Some(to) = plan.promote {
            self.ctx
                .repo
                .store()
                .advance_state(poll_id, poll.state, to)
                .await?;
            info!(poll_id, from = %poll.state, to = %to, "poll state advanced");
        }
        let state = plan.resulting_state(poll.state);
        debug!(poll_id, state = %state, decision = ?plan.decision, "decided");

        let follow_up = match plan.decision {
            Decision::Wait { delay } => NewTask::timer(poll_id, now + to_chrono(delay)),
            Decision::Activate => NewTask::new(poll_id, TaskKind::Activate, now),
            Decision::Expire => NewTask::new(poll_id, TaskKind::Expire, now),
            Decision::Done => return Ok(Step::Finished),
        };
        Ok(Step::Continue(vec![follow_up]))
    }
}
