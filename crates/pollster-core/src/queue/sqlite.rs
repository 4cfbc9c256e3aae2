use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    NewTask, PendingTask, RetryOutcome, RetryPolicy, Task, TaskKind, TaskList, TaskQueue,
    WorkflowOutcome, WorkflowRecord, WorkflowStart, WorkflowStatus,
};
use crate::clock::{to_chrono, Clock};
use crate::error::{CoreError, Result};
use crate::storage::sqlite::{from_millis, to_millis};
use crate::storage::{SchedulerConfig, SqliteHandle};

/// [`TaskQueue`] on top of the `tasks` and `workflows` tables.
///
/// Workers in this process are woken through a [`Notify`] when work is
/// enqueued; work enqueued by other processes is picked up on the next idle
/// poll.
pub struct SqliteTaskQueue {
    db: SqliteHandle,
    clock: Arc<dyn Clock>,
    lease: Duration,
    idle_poll: Duration,
    retry: RetryPolicy,
    wake: Arc<Notify>,
}

impl SqliteTaskQueue {
    pub fn new(db: SqliteHandle, clock: Arc<dyn Clock>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            db,
            clock,
            lease: defaults.lease(),
            idle_poll: defaults.idle_poll(),
            retry: RetryPolicy::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_scheduler(mut self, cfg: &SchedulerConfig) -> Self {
        self.lease = cfg.lease();
        self.idle_poll = cfg.idle_poll();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// How long an idle worker on `list` should sleep before looking again.
    async fn idle_wait(&self, list: TaskList) -> Result<Duration> {
        let now = to_millis(self.now());
        let next: Option<i64> = self
            .db
            .run(move |conn| {
                Ok(conn.query_row(
                    "SELECT MIN(CASE WHEN lease_token IS NULL THEN visible_at ELSE lease_until END)
                     FROM tasks WHERE list = ?1",
                    params![list.as_str()],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(match next {
            Some(at) if at > now => self.idle_poll.min(Duration::from_millis((at - now) as u64)),
            _ => self.idle_poll,
        })
    }
}

fn insert_task(conn: &Connection, task: &NewTask, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tasks (list, workflow_id, kind, visible_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            task.kind.list().as_str(),
            task.workflow_id,
            task.kind.as_str(),
            to_millis(task.visible_at),
            now,
        ],
    )?;
    Ok(())
}

fn workflow_status(conn: &Connection, poll_id: &str) -> Result<Option<WorkflowStatus>> {
    conn.query_row(
        "SELECT status FROM workflows WHERE poll_id = ?1",
        params![poll_id],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|s| s.parse().map_err(CoreError::from))
    .transpose()
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn start_workflow(&self, poll_id: &str) -> Result<WorkflowStart> {
        let poll_id = poll_id.to_string();
        let now = self.now();
        let started = self
            .db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now_ms = to_millis(now);
                match workflow_status(&tx, &poll_id)? {
                    Some(WorkflowStatus::Running) => return Ok(WorkflowStart::AlreadyRunning),
                    Some(_) => {
                        tx.execute(
                            "UPDATE workflows SET run = run + 1, status = 'Running',
                                 failure_reason = NULL, started_at = ?2, closed_at = NULL
                             WHERE poll_id = ?1",
                            params![poll_id, now_ms],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO workflows (poll_id, run, status, started_at)
                             VALUES (?1, 1, 'Running', ?2)",
                            params![poll_id, now_ms],
                        )?;
                    }
                }
                insert_task(&tx, &NewTask::new(&poll_id, TaskKind::Decide, now), now_ms)?;
                tx.commit()?;
                Ok(WorkflowStart::Started)
            })
            .await?;
        if started == WorkflowStart::Started {
            self.wake.notify_waiters();
        }
        Ok(started)
    }

    async fn workflow(&self, poll_id: &str) -> Result<Option<WorkflowRecord>> {
        let poll_id = poll_id.to_string();
        self.db
            .run(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT poll_id, run, status, failure_reason, started_at, closed_at
                         FROM workflows WHERE poll_id = ?1",
                        params![poll_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, u32>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, Option<String>>(3)?,
                                row.get::<_, i64>(4)?,
                                row.get::<_, Option<i64>>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                row.map(|(poll_id, run, status, failure_reason, started_at, closed_at)| {
                    Ok(WorkflowRecord {
                        poll_id,
                        run,
                        status: status.parse()?,
                        failure_reason,
                        started_at: from_millis(started_at),
                        closed_at: closed_at.map(from_millis),
                    })
                })
                .transpose()
            })
            .await
    }

    async fn pending(&self, poll_id: &str) -> Result<Vec<PendingTask>> {
        let poll_id = poll_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT kind, visible_at, attempts, lease_token IS NOT NULL, last_error
                     FROM tasks WHERE workflow_id = ?1 ORDER BY visible_at, id",
                )?;
                let rows = stmt
                    .query_map(params![poll_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .map(|(kind, visible_at, attempts, leased, last_error)| {
                        Ok(PendingTask {
                            kind: kind.parse()?,
                            visible_at: from_millis(visible_at),
                            attempts,
                            leased,
                            last_error,
                        })
                    })
                    .collect()
            })
            .await
    }

    async fn try_claim(&self, list: TaskList) -> Result<Option<Task>> {
        let now = to_millis(self.now());
        let lease_until = now + self.lease.as_millis() as i64;
        let token = uuid::Uuid::new_v4().to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let candidate = tx
                    .query_row(
                        "SELECT t.id, t.workflow_id, t.kind, t.attempts, t.visible_at
                         FROM tasks t
                         WHERE t.list = ?1
                           AND t.visible_at <= ?2
                           AND (t.lease_token IS NULL OR t.lease_until <= ?2)
                           AND NOT EXISTS (
                               SELECT 1 FROM tasks o
                               WHERE o.workflow_id = t.workflow_id
                                 AND o.id <> t.id
                                 AND o.lease_token IS NOT NULL
                                 AND o.lease_until > ?2)
                         ORDER BY t.visible_at, t.id
                         LIMIT 1",
                        params![list.as_str(), now],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, u32>(3)?,
                                row.get::<_, i64>(4)?,
                            ))
                        },
                    )
                    .optional()?;

                let Some((id, workflow_id, kind, attempts, visible_at)) = candidate else {
                    return Ok(None);
                };
                tx.execute(
                    "UPDATE tasks SET lease_token = ?2, lease_until = ?3, attempts = attempts + 1
                     WHERE id = ?1",
                    params![id, token, lease_until],
                )?;
                tx.commit()?;
                Ok(Some(Task {
                    id,
                    workflow_id,
                    kind: kind.parse()?,
                    attempts: attempts + 1,
                    lease_token: token,
                    visible_at: from_millis(visible_at),
                }))
            })
            .await
    }

    async fn claim(&self, list: TaskList, cancel: &CancellationToken) -> Result<Option<Task>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register before looking so an enqueue between the check and the
            // sleep still wakes us.
            notified.as_mut().enable();

            if let Some(task) = self.try_claim(list).await? {
                debug!(list = %list, task_id = task.id, kind = %task.kind, workflow = %task.workflow_id, "claimed task");
                return Ok(Some(task));
            }

            let wait = self.idle_wait(list).await?;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn complete(&self, lease_token: &str, follow_ups: Vec<NewTask>) -> Result<()> {
        let token = lease_token.to_string();
        let now = to_millis(self.now());
        let enqueued = !follow_ups.is_empty();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let workflow_id: Option<String> = tx
                    .query_row(
                        "SELECT workflow_id FROM tasks WHERE lease_token = ?1",
                        params![token],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(workflow_id) = workflow_id else {
                    return Err(CoreError::LeaseLost { token });
                };
                tx.execute("DELETE FROM tasks WHERE lease_token = ?1", params![token])?;

                if workflow_status(&tx, &workflow_id)? == Some(WorkflowStatus::Running) {
                    for task in &follow_ups {
                        insert_task(&tx, task, now)?;
                    }
                } else if !follow_ups.is_empty() {
                    warn!(workflow = %workflow_id, "dropping follow-up tasks for closed workflow");
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        if enqueued {
            self.wake.notify_waiters();
        }
        Ok(())
    }

    async fn rearm(&self, poll_id: &str) -> Result<usize> {
        let poll_id = poll_id.to_string();
        let now = to_millis(self.now());
        let moved = self
            .db
            .run(move |conn| {
                Ok(conn.execute(
                    "UPDATE tasks SET visible_at = ?2
                     WHERE workflow_id = ?1 AND kind = 'decide'
                       AND lease_token IS NULL AND visible_at > ?2",
                    params![poll_id, now],
                )?)
            })
            .await?;
        if moved > 0 {
            self.wake.notify_waiters();
        }
        Ok(moved)
    }

    async fn retry(&self, lease_token: &str, reason: &str) -> Result<RetryOutcome> {
        let token = lease_token.to_string();
        let reason = reason.to_string();
        let now = self.now();
        let policy = self.retry;
        let outcome = self
            .db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let attempts: Option<u32> = tx
                    .query_row(
                        "SELECT attempts FROM tasks WHERE lease_token = ?1",
                        params![token],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(attempts) = attempts else {
                    return Err(CoreError::LeaseLost { token });
                };

                if attempts >= policy.max_attempts {
                    tx.execute(
                        "UPDATE tasks SET last_error = ?2 WHERE lease_token = ?1",
                        params![token, reason],
                    )?;
                    tx.commit()?;
                    return Ok(RetryOutcome::Exhausted { attempts });
                }

                let at = now + to_chrono(policy.backoff(attempts));
                tx.execute(
                    "UPDATE tasks SET lease_token = NULL, lease_until = NULL,
                         visible_at = ?2, last_error = ?3
                     WHERE lease_token = ?1",
                    params![token, to_millis(at), reason],
                )?;
                tx.commit()?;
                Ok(RetryOutcome::Scheduled {
                    attempt: attempts + 1,
                    at,
                })
            })
            .await?;
        if matches!(outcome, RetryOutcome::Scheduled { .. }) {
            self.wake.notify_waiters();
        }
        Ok(outcome)
    }

    async fn close_workflow(&self, poll_id: &str, outcome: WorkflowOutcome) -> Result<()> {
        let poll_id = poll_id.to_string();
        let now = to_millis(self.now());
        let (status, reason) = match outcome {
            WorkflowOutcome::Completed => (WorkflowStatus::Completed, None),
            WorkflowOutcome::Failed(reason) => (WorkflowStatus::Failed, Some(reason)),
        };
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE workflows SET status = ?2, failure_reason = ?3, closed_at = ?4
                     WHERE poll_id = ?1",
                    params![poll_id, status.as_str(), reason, now],
                )?;
                if changed == 0 {
                    return Err(CoreError::NotFound {
                        kind: "Workflow",
                        id: poll_id,
                    });
                }
                tx.execute("DELETE FROM tasks WHERE workflow_id = ?1", params![poll_id])?;
                tx.commit()?;
                Ok(())
            })
            .await
    }
}
