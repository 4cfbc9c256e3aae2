//! Entry points used by the CLI: create, read, vote, feed, status.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::poll::{ActivePollMarker, NewPoll, PollDefinition, PollState, Tally};
use crate::queue::{PendingTask, RetryPolicy, SqliteTaskQueue, TaskQueue, WorkflowRecord};
use crate::repository::PollRepository;
use crate::storage::{Config, SqliteHandle, SqlitePollStore};
use crate::votes::VoteAggregator;
use crate::workflow::{ChangeNotifier, WorkerContext};

/// A poll in the active feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    #[serde(flatten)]
    pub marker: ActivePollMarker,
    pub poll: PollDefinition,
}

/// Scheduling status of one poll.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub poll_id: String,
    pub state: PollState,
    pub workflow: Option<WorkflowRecord>,
    pub pending: Vec<PendingTask>,
}

#[derive(Clone)]
pub struct PollService {
    repo: PollRepository,
    changes: ChangeNotifier,
    votes: VoteAggregator,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl PollService {
    pub fn new(
        repo: PollRepository,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        require_active_votes: bool,
    ) -> Self {
        let changes = ChangeNotifier::new(Arc::clone(repo.store()), Arc::clone(&queue));
        let votes = VoteAggregator::new(Arc::clone(repo.store()), require_active_votes);
        Self {
            repo,
            changes,
            votes,
            queue,
            clock,
        }
    }

    /// Wire up storage, queue and notifier from `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let db = SqliteHandle::open(config.database_path()?)?;
        Self::with_handle(config, db)
    }

    /// Same as [`PollService::open`] over an existing database handle.
    pub fn with_handle(config: &Config, db: SqliteHandle) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(LogNotifier),
        };
        let queue = SqliteTaskQueue::new(db.clone(), Arc::clone(&clock))
            .with_scheduler(&config.scheduler)
            .with_retry(RetryPolicy::from(&config.retry));
        let repo = PollRepository::new(
            Arc::new(SqlitePollStore::new(db)),
            notifier,
            config.notifications.clone(),
        );
        Ok(Self::new(
            repo,
            Arc::new(queue),
            clock,
            config.voting.require_active,
        ))
    }

    /// Context for spawning workers that share this service's backends.
    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            repo: self.repo.clone(),
            queue: Arc::clone(&self.queue),
            clock: Arc::clone(&self.clock),
        }
    }

    pub fn repository(&self) -> &PollRepository {
        &self.repo
    }

    /// Validate, store and schedule a new poll.
    pub async fn create_poll(&self, request: NewPoll) -> Result<PollDefinition> {
        let now = self.clock.now();
        request.validate(now)?;
        let saved = self.repo.put(request.into_definition(now)).await?;
        info!(poll_id = %saved.poll.id, author = %saved.poll.author, "poll created");
        self.changes.on_saved(&saved.poll).await?;
        Ok(saved.poll)
    }

    /// Save edits to an existing poll's descriptive fields.
    ///
    /// Moving the window of a scheduled or active poll wakes its workflow so
    /// the next decision uses the new times.
    pub async fn update_poll(&self, poll: PollDefinition) -> Result<PollDefinition> {
        let stored = if poll.has_id() {
            self.repo.find(&poll.id).await?
        } else {
            None
        };
        let Some(stored) = stored else {
            return Err(CoreError::poll_not_found(poll.id));
        };
        let saved = self.repo.put(poll).await?;
        let window_moved = saved.poll.start_time != stored.start_time
            || saved.poll.end_time != stored.end_time;
        if window_moved && matches!(saved.poll.state, PollState::Scheduled | PollState::Active) {
            let moved = self.queue.rearm(&saved.poll.id).await?;
            info!(poll_id = %saved.poll.id, state = %saved.poll.state, moved, "poll window changed; workflow rearmed");
        }
        self.changes.on_saved(&saved.poll).await?;
        Ok(saved.poll)
    }

    pub async fn get_poll(&self, id: &str) -> Result<PollDefinition> {
        self.repo.get(id).await
    }

    pub async fn polls_by_author(&self, author: &str) -> Result<Vec<PollDefinition>> {
        self.repo.query_by_author(author).await
    }

    /// Delete a poll. A running workflow fails on its next step.
    pub async fn delete_poll(&self, id: &str) -> Result<()> {
        if !self.repo.delete(id).await? {
            return Err(CoreError::poll_not_found(id));
        }
        info!(poll_id = %id, "poll deleted");
        Ok(())
    }

    pub async fn submit_vote(&self, poll_id: &str, option_id: &str) -> Result<Tally> {
        self.votes.submit_vote(poll_id, option_id).await
    }

    /// Active polls, earliest activation first.
    pub async fn feed(&self) -> Result<Vec<FeedEntry>> {
        let mut entries = Vec::new();
        for marker in self.repo.active_markers().await? {
            // A poll deleted since the listing simply drops out of the feed.
            if let Some(poll) = self.repo.find(&marker.id).await? {
                entries.push(FeedEntry { marker, poll });
            }
        }
        Ok(entries)
    }

    pub async fn workflow_status(&self, poll_id: &str) -> Result<WorkflowReport> {
        let poll = self.repo.get(poll_id).await?;
        Ok(WorkflowReport {
            state: poll.state,
            workflow: self.queue.workflow(poll_id).await?,
            pending: self.queue.pending(poll_id).await?,
            poll_id: poll.id,
        })
    }

    /// Start workflows for polls that were saved but never scheduled.
    pub async fn recover(&self) -> Result<usize> {
        self.changes.recover().await
    }
}
