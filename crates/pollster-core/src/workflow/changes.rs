use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::poll::{PollDefinition, PollState};
use crate::queue::{TaskQueue, WorkflowStart};
use crate::storage::PollStore;

/// Starts a workflow for every newly persisted poll.
#[derive(Clone)]
pub struct ChangeNotifier {
    store: Arc<dyn PollStore>,
    queue: Arc<dyn TaskQueue>,
}

impl ChangeNotifier {
    pub fn new(store: Arc<dyn PollStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// React to a saved poll. Polls past `Unscheduled` already have (or had)
    /// a workflow and are skipped.
    pub async fn on_saved(&self, poll: &PollDefinition) -> Result<Option<WorkflowStart>> {
        if poll.state != PollState::Unscheduled {
            debug!(poll_id = %poll.id, state = %poll.state, "skipping poll that is already scheduled");
            return Ok(None);
        }
        let started = self.queue.start_workflow(&poll.id).await?;
        match started {
            WorkflowStart::Started => info!(poll_id = %poll.id, "workflow started"),
            WorkflowStart::AlreadyRunning => debug!(poll_id = %poll.id, "workflow already running"),
        }
        Ok(Some(started))
    }

    /// Start workflows for live polls that never got one, e.g. after a crash
    /// between saving a poll and starting its workflow. Returns how many were started.
    pub async fn recover(&self) -> Result<usize> {
        let mut started = 0;
        for state in [PollState::Unscheduled, PollState::Scheduled, PollState::Active] {
            for poll in self.store.list_by_state(state).await? {
                if self.queue.workflow(&poll.id).await?.is_some() {
                    continue;
                }
                if self.queue.start_workflow(&poll.id).await? == WorkflowStart::Started {
                    info!(poll_id = %poll.id, state = %poll.state, "recovered orphaned poll");
                    started += 1;
                }
            }
        }
        Ok(started)
    }
}
