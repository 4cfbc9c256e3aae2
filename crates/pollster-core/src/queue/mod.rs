//! Durable task queue driving poll workflows.
//!
//! Each poll has at most one running workflow. Work for a workflow is a
//! sequence of tasks on two lists: decision tasks (evaluate the state
//! machine) and activity tasks (activate or expire the poll). A timer is a
//! decision task whose `visible_at` lies in the future, so pending timers
//! survive restarts along with everything else.
//!
//! Guarantees provided by every implementation:
//! - a claimed task is leased; nobody else sees it until the lease expires
//! - at most one task per workflow is leased at any time
//! - completing a task and enqueueing its follow-ups is atomic

mod sqlite;

pub use sqlite::SqliteTaskQueue;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{DatabaseError, Result};
use crate::storage::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskList {
    Decision,
    Activity,
}

impl TaskList {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskList::Decision => "decision",
            TaskList::Activity => "activity",
        }
    }
}

impl fmt::Display for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Decide,
    Activate,
    Expire,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Decide => "decide",
            TaskKind::Activate => "activate",
            TaskKind::Expire => "expire",
        }
    }

    /// The list a task of this kind is delivered on.
    pub fn list(self) -> TaskList {
        match self {
            TaskKind::Decide => TaskList::Decision,
            TaskKind::Activate | TaskKind::Expire => TaskList::Activity,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decide" => Ok(TaskKind::Decide),
            "activate" => Ok(TaskKind::Activate),
            "expire" => Ok(TaskKind::Expire),
            other => Err(DatabaseError::Corrupt(format!("task kind '{other}'"))),
        }
    }
}

/// A leased task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub workflow_id: String,
    pub kind: TaskKind,
    /// Delivery count including this one.
    pub attempts: u32,
    pub lease_token: String,
    pub visible_at: DateTime<Utc>,
}

/// A task to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub workflow_id: String,
    pub kind: TaskKind,
    pub visible_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(workflow_id: impl Into<String>, kind: TaskKind, visible_at: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            kind,
            visible_at,
        }
    }

    /// A decision task that becomes visible when the timer fires.
    pub fn timer(workflow_id: impl Into<String>, fires_at: DateTime<Utc>) -> Self {
        Self::new(workflow_id, TaskKind::Decide, fires_at)
    }
}

/// Queue contents for one workflow, as reported by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTask {
    pub kind: TaskKind,
    pub visible_at: DateTime<Utc>,
    pub attempts: u32,
    pub leased: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Completed => "Completed",
            WorkflowStatus::Failed => "Failed",
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(WorkflowStatus::Running),
            "Completed" => Ok(WorkflowStatus::Completed),
            "Failed" => Ok(WorkflowStatus::Failed),
            other => Err(DatabaseError::Corrupt(format!("workflow status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowRecord {
    pub poll_id: String,
    /// Incremented each time a closed workflow is started again.
    pub run: u32,
    pub status: WorkflowStatus,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStart {
    Started,
    AlreadyRunning,
}

/// How a workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The task goes back on its list and becomes visible at `at`.
    Scheduled { attempt: u32, at: DateTime<Utc> },
    /// No attempts left; the caller should fail the workflow.
    Exhausted { attempts: u32 },
}

/// Exponential backoff for redelivered tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base: Duration::from_millis(cfg.backoff_base_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering a task that failed on delivery `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Register a workflow for `poll_id` and enqueue its first decision.
    ///
    /// Idempotent while the workflow is running.
    async fn start_workflow(&self, poll_id: &str) -> Result<WorkflowStart>;

    async fn workflow(&self, poll_id: &str) -> Result<Option<WorkflowRecord>>;

    async fn pending(&self, poll_id: &str) -> Result<Vec<PendingTask>>;

    /// Lease the next visible task on `list`, if any.
    async fn try_claim(&self, list: TaskList) -> Result<Option<Task>>;

    /// Wait for a task on `list`. Returns `None` once `cancel` fires.
    async fn claim(&self, list: TaskList, cancel: &CancellationToken) -> Result<Option<Task>>;

    /// Acknowledge a leased task and enqueue `follow_ups` in one step.
    ///
    /// Fails with `LeaseLost` if the lease expired and someone else took the task.
    async fn complete(&self, lease_token: &str, follow_ups: Vec<NewTask>) -> Result<()>;

    /// Make the workflow's waiting decision task visible now.
    ///
    /// Leased tasks are left alone; no task is added. Returns how many tasks
    /// were moved.
    async fn rearm(&self, poll_id: &str) -> Result<usize>;

    /// Release a leased task for redelivery after a backoff.
    async fn retry(&self, lease_token: &str, reason: &str) -> Result<RetryOutcome>;

    /// Close the workflow and drop whatever tasks it still has queued.
    async fn close_workflow(&self, poll_id: &str, outcome: WorkflowOutcome) -> Result<()>;
}
