mod config;
pub mod migrations;
pub mod polls;
pub mod sqlite;

pub use config::{
    Config, NotificationsConfig, RetryConfig, SchedulerConfig, StorageConfig, VotingConfig,
};
pub use polls::SqlitePollStore;
pub use sqlite::SqliteHandle;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::poll::{ActivePollMarker, PollDefinition, PollState, Tally};

/// Returns the data directory.
///
/// `POLLSTER_HOME` wins when set; otherwise `~/.config/pollster/`, or
/// `~/.config/pollster-dev/` when `POLLSTER_ENV=dev`.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os("POLLSTER_HOME") {
        Some(home) => PathBuf::from(home),
        None => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");
            let env = std::env::var("POLLSTER_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("pollster-dev")
            } else {
                base_dir.join("pollster")
            }
        }
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Persistence for poll records and the active-poll index.
///
/// State-changing operations are conditional: they name the state they
/// expect to move from and fail with `Conflict` otherwise, so concurrent or
/// replayed steps cannot move a poll backwards.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<PollDefinition>>;

    /// Insert or update a poll. Returns `true` when the row was newly created.
    ///
    /// Updates touch descriptive fields and option texts only; state, the
    /// announcement marker and vote counts are owned by the workflow and the
    /// vote aggregator.
    async fn upsert(&self, poll: &PollDefinition) -> Result<bool>;

    /// Delete a poll with its options and active marker. Returns `true` if it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn query_by_author(&self, author: &str) -> Result<Vec<PollDefinition>>;

    async fn list_by_state(&self, state: PollState) -> Result<Vec<PollDefinition>>;

    /// Active markers ordered by activation time, then id.
    async fn list_active(&self) -> Result<Vec<ActivePollMarker>>;

    /// Compare-and-set the state forward from `from` to `to`.
    async fn advance_state(&self, id: &str, from: PollState, to: PollState) -> Result<()>;

    /// `Scheduled -> Active` plus marker creation, atomically.
    ///
    /// Returns `false` without side effects when the poll is already active.
    async fn activate(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// `Active -> Expired` plus marker removal, atomically.
    ///
    /// Returns `false` without side effects when the poll is already expired.
    async fn expire(&self, id: &str) -> Result<bool>;

    /// Record that the announcement for `state` has been published.
    async fn mark_announced(&self, id: &str, state: PollState) -> Result<()>;

    /// Atomically add one vote to `option_id` and return the full tally.
    async fn increment_vote(&self, id: &str, option_id: &str, require_active: bool)
        -> Result<Tally>;
}
