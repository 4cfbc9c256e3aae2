//! Activation and expiry steps.
//!
//! Both steps are safe to run again after a crash or redelivery: the state
//! change and marker update commit together, and the announcement is
//! published only while the poll's `announced` state lags behind.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::{settle_failure, WorkerContext};
use crate::error::{CoreError, Result};
use crate::events::Announcement;
use crate::notify::announce;
use crate::poll::{PollDefinition, PollState};
use crate::queue::{NewTask, Task, TaskKind, TaskList};
use crate::repository::PollRepository;

/// Move a scheduled poll to `Active`, index it, and announce it.
///
/// Already-active polls are left as they are; their announcement is only
/// published if an earlier attempt did not get that far.
pub async fn activate_poll(
    repo: &PollRepository,
    poll_id: &str,
    now: DateTime<Utc>,
) -> Result<PollDefinition> {
    let poll = repo.get(poll_id).await?;
    match poll.state {
        PollState::Scheduled => {
            if now >= poll.end_time {
                return Err(CoreError::fatal(
                    poll_id,
                    "End time has already passed before activating the poll",
                ));
            }
            if repo.store().activate(poll_id, now).await? {
                info!(poll_id, "poll activated");
            }
        }
        PollState::Active => {}
        actual => {
            return Err(CoreError::Conflict {
                id: poll_id.to_string(),
                expected: PollState::Scheduled,
                actual,
            })
        }
    }

    let mut poll = poll;
    poll.state = PollState::Active;
    if lags(&poll, PollState::Active) {
        publish(repo, &poll, Announcement::activated(&poll)).await?;
    }
    Ok(poll)
}

/// Move an active poll to `Expired`, drop it from the index, and announce
/// the final tally.
pub async fn deactivate_poll(repo: &PollRepository, poll_id: &str) -> Result<PollDefinition> {
    let poll = repo.get(poll_id).await?;
    match poll.state {
        PollState::Active => {
            if repo.store().expire(poll_id).await? {
                info!(poll_id, "poll expired");
            }
        }
        PollState::Expired => {}
        actual => {
            return Err(CoreError::Conflict {
                id: poll_id.to_string(),
                expected: PollState::Active,
                actual,
            })
        }
    }

    // Votes are closed now; reload for the final counts.
    let poll = repo.get(poll_id).await?;
    if lags(&poll, PollState::Expired) {
        publish(repo, &poll, Announcement::expired(&poll)).await?;
    }
    Ok(poll)
}

fn lags(poll: &PollDefinition, state: PollState) -> bool {
    poll.announced.map_or(true, |announced| announced < state)
}

async fn publish(
    repo: &PollRepository,
    poll: &PollDefinition,
    announcement: Announcement,
) -> Result<()> {
    let topic = poll
        .topic
        .clone()
        .ok_or_else(|| CoreError::fatal(&poll.id, "poll has no notification topic"))?;
    announce(repo.notifier().as_ref(), &topic, &announcement).await?;
    repo.store()
        .mark_announced(&poll.id, announcement.state())
        .await?;
    info!(poll_id = %poll.id, topic = %topic, subject = %announcement.subject(), "announcement published");
    Ok(())
}

/// Claims activity tasks and runs the matching step.
pub struct ActivityWorker {
    name: String,
    ctx: WorkerContext,
}

impl ActivityWorker {
    pub fn new(name: impl Into<String>, ctx: WorkerContext) -> Self {
        Self {
            name: name.into(),
            ctx,
        }
    }

    /// Process activity tasks until `shutdown` fires.
    #[instrument(skip(self, shutdown), fields(worker = %self.name))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("activity worker started");
        loop {
            match self.ctx.queue.claim(TaskList::Activity, &shutdown).await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim activity task");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("activity worker stopped");
    }

    pub async fn process(&self, task: Task) {
        let poll_id = task.workflow_id.as_str();
        let now = self.ctx.clock.now();
        let result = match task.kind {
            TaskKind::Activate => activate_poll(&self.ctx.repo, poll_id, now).await,
            TaskKind::Expire => deactivate_poll(&self.ctx.repo, poll_id).await,
            TaskKind::Decide => Err(CoreError::fatal(
                poll_id,
                "decide task delivered on the activity list",
            )),
        };

        match result {
            Ok(poll) => {
                let next = NewTask::new(poll_id, TaskKind::Decide, now);
                if let Err(e) = self.ctx.queue.complete(&task.lease_token, vec![next]).await {
                    warn!(poll_id, state = %poll.state, error = %e, "could not acknowledge activity");
                }
            }
            Err(e) => {
                warn!(poll_id, task = %task.kind, attempt = task.attempts, error = %e, "activity failed");
                settle_failure(self.ctx.queue.as_ref(), &task, e).await;
            }
        }
    }
}
