//! Vote aggregation.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::poll::Tally;
use crate::storage::PollStore;

/// Counts votes with a single atomic increment per vote, so concurrent
/// voters never lose updates.
#[derive(Clone)]
pub struct VoteAggregator {
    store: Arc<dyn PollStore>,
    require_active: bool,
}

impl VoteAggregator {
    pub fn new(store: Arc<dyn PollStore>, require_active: bool) -> Self {
        Self {
            store,
            require_active,
        }
    }

    /// Add one vote for `option_id` and return the poll's full tally.
    ///
    /// # Errors
    /// `NotFound` for an unknown poll or option, `PollNotActive` when voting
    /// is restricted to active polls and this one is not.
    pub async fn submit_vote(&self, poll_id: &str, option_id: &str) -> Result<Tally> {
        let mut violations = Vec::new();
        for (field, value) in [("poll_id", poll_id), ("option_id", option_id)] {
            if value.trim().is_empty() {
                violations.push(ValidationError::Blank {
                    field: field.to_string(),
                });
            }
        }
        if let Some(err) = ValidationError::collect(violations) {
            return Err(err.into());
        }

        let tally = self
            .store
            .increment_vote(poll_id, option_id, self.require_active)
            .await?;
        debug!(poll_id = %poll_id, option_id = %option_id, votes = tally.get(option_id).copied().unwrap_or(0), "vote recorded");
        Ok(tally)
    }
}
