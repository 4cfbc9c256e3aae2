//! Integration tests for the poll lifecycle driven by real workers.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::{harness, harness_on, new_poll, state_and_marker};
use pollster_core::queue::{TaskKind, TaskList, TaskQueue};
use pollster_core::storage::{NotificationsConfig, SchedulerConfig};
use pollster_core::workflow::{ActivityWorker, DeciderWorker};
use pollster_core::{
    ManualClock, MemoryNotifier, Notifier, PollRepository, PollService, PollState, SqliteHandle,
    SqlitePollStore, SqliteTaskQueue, SystemClock, WorkerPool, WorkflowStatus,
};
use tokio::sync::{Notify, Semaphore};

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        decider_workers: 2,
        activity_workers: 2,
        idle_poll_ms: 100,
        ..SchedulerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_lifecycle_with_workers() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteHandle::open(dir.path().join("pollster.db")).unwrap();
    let h = harness_on(db, Arc::new(SystemClock));

    let created_at = Utc::now();
    let poll = h
        .service
        .create_poll(new_poll(created_at, Duration::seconds(2), Duration::seconds(4)))
        .await
        .unwrap();
    assert_eq!(poll.state, PollState::Unscheduled);

    let pool = WorkerPool::spawn(h.service.worker_context(), &fast_scheduler());

    let mut observed = vec![PollState::Unscheduled];
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(12);
    loop {
        let (state, marker) = state_and_marker(&h.db, &poll.id).await;
        let state: PollState = state.parse().unwrap();
        let now = Utc::now();

        assert_eq!(state == PollState::Active, marker, "marker out of step with {state}");
        if state == PollState::Active {
            assert!(now >= poll.start_time, "active before start time");
        }
        if state >= PollState::Expired {
            assert!(now >= poll.end_time, "expired before end time");
        }
        if observed.last() != Some(&state) {
            observed.push(state);
        }
        if state == PollState::Expired || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    pool.shutdown().await;

    // Scheduled may be too brief to sample; everything else must be seen in order.
    assert!(observed.windows(2).all(|w| w[0] < w[1]), "regressed: {observed:?}");
    assert!(observed.contains(&PollState::Active), "never active: {observed:?}");
    assert_eq!(observed.last(), Some(&PollState::Expired));

    let status = h.service.workflow_status(&poll.id).await.unwrap();
    let workflow = status.workflow.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(status.pending.is_empty());
    assert!(h.service.feed().await.unwrap().is_empty());

    let topic = poll.topic.unwrap();
    let published = h.notifier.published_to(&topic);
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].subject, "Pollster Poll Lunch Activated");
    assert_eq!(published[1].subject, "Poll Lunch has expired");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_shutdown_returns_promptly_when_idle() {
    let h = harness(Arc::new(SystemClock));
    let pool = WorkerPool::spawn(h.service.worker_context(), &fast_scheduler());
    assert_eq!(pool.len(), 4);
    tokio::time::timeout(StdDuration::from_secs(5), pool.shutdown())
        .await
        .unwrap();
}

/// Holds every publish until the test lets it through.
struct GatedNotifier {
    inner: MemoryNotifier,
    entered: Notify,
    release: Semaphore,
}

impl GatedNotifier {
    fn new() -> Self {
        Self {
            inner: MemoryNotifier::new(),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl Notifier for GatedNotifier {
    async fn create_topic(&self, name: &str) -> pollster_core::Result<String> {
        self.inner.create_topic(name).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        protocol: &str,
        endpoint: &str,
    ) -> pollster_core::Result<()> {
        self.inner.subscribe(topic, protocol, endpoint).await
    }

    async fn publish(
        &self,
        topic: &str,
        subject: &str,
        message: &str,
    ) -> pollster_core::Result<()> {
        self.entered.notify_one();
        let _permit = self.release.acquire().await.unwrap();
        self.inner.publish(topic, subject, message).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_finishes_step_in_flight() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let db = SqliteHandle::open_memory().unwrap();
    let notifier = Arc::new(GatedNotifier::new());
    let repo = PollRepository::new(
        Arc::new(SqlitePollStore::new(db.clone())),
        notifier.clone(),
        NotificationsConfig::default(),
    );
    let queue = SqliteTaskQueue::new(db.clone(), clock.clone()).with_scheduler(&fast_scheduler());
    let service = PollService::new(repo, Arc::new(queue), clock.clone(), true);

    let poll = service
        .create_poll(new_poll(start, Duration::seconds(5), Duration::seconds(60)))
        .await
        .unwrap();
    driver(service.worker_context()).drain().await;
    assert_eq!(state_and_marker(&db, &poll.id).await.0, "Scheduled");

    clock.advance(Duration::seconds(6));
    let pool = WorkerPool::spawn(service.worker_context(), &fast_scheduler());
    tokio::time::timeout(StdDuration::from_secs(5), notifier.entered.notified())
        .await
        .expect("activation never reached the notifier");

    // Cancel while the activation is parked inside publish.
    let stopping = tokio::spawn(pool.shutdown());
    tokio::time::sleep(StdDuration::from_millis(300)).await;
    assert!(!stopping.is_finished(), "pool stopped with a step still running");

    notifier.release.add_permits(1);
    tokio::time::timeout(StdDuration::from_secs(5), stopping)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state_and_marker(&db, &poll.id).await, ("Active".to_string(), true));
    assert_eq!(notifier.inner.published().len(), 1);
    assert_eq!(
        service.get_poll(&poll.id).await.unwrap().announced,
        Some(PollState::Active)
    );

    // The activity was acknowledged and its follow-up was never picked up.
    let pending = service.workflow_status(&poll.id).await.unwrap().pending;
    assert_eq!(pending.len(), 1, "{pending:?}");
    assert_eq!(pending[0].kind, TaskKind::Decide);
    assert_eq!(pending[0].attempts, 0);
    assert!(!pending[0].leased);
}

/// Step the workers by hand against a manual clock.
struct Driver {
    decider: DeciderWorker,
    activity: ActivityWorker,
    queue: Arc<dyn TaskQueue>,
}

impl Driver {
    async fn decide(&self) -> bool {
        match self.queue.try_claim(TaskList::Decision).await.unwrap() {
            Some(task) => {
                self.decider.process(task).await;
                true
            }
            None => false,
        }
    }

    async fn act(&self) -> bool {
        match self.queue.try_claim(TaskList::Activity).await.unwrap() {
            Some(task) => {
                self.activity.process(task).await;
                true
            }
            None => false,
        }
    }

    /// Run every task that is currently due.
    async fn drain(&self) {
        while self.decide().await || self.act().await {}
    }
}

fn driver(ctx: pollster_core::WorkerContext) -> Driver {
    Driver {
        queue: Arc::clone(&ctx.queue),
        decider: DeciderWorker::new("decider-test", ctx.clone()),
        activity: ActivityWorker::new("activity-test", ctx),
    }
}

#[tokio::test]
async fn test_lifecycle_on_manual_clock() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let h = harness(clock.clone());
    let d = driver(h.service.worker_context());

    let poll = h
        .service
        .create_poll(new_poll(start, Duration::seconds(10), Duration::seconds(20)))
        .await
        .unwrap();

    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Scheduled".to_string(), false));

    clock.advance(Duration::seconds(10));
    d.drain().await;
    assert_eq!(
        state_and_marker(&h.db, &poll.id).await.0,
        "Scheduled",
        "timer fires one guard second after start"
    );

    clock.advance(Duration::seconds(1));
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Active".to_string(), true));
    h.service.submit_vote(&poll.id, "2").await.unwrap();

    clock.advance(Duration::seconds(10));
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Expired".to_string(), false));

    let workflow = h.service.workflow_status(&poll.id).await.unwrap().workflow.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let published = h.notifier.published();
    assert!(published[1].message.contains("Ramen: 1 Votes"));
}

#[tokio::test]
async fn test_moving_start_earlier_activates_at_new_time() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let h = harness(clock.clone());
    let d = driver(h.service.worker_context());

    let poll = h
        .service
        .create_poll(new_poll(start, Duration::seconds(600), Duration::seconds(1200)))
        .await
        .unwrap();
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await.0, "Scheduled");

    let mut edited = h.service.get_poll(&poll.id).await.unwrap();
    edited.start_time = start + Duration::seconds(5);
    h.service.update_poll(edited).await.unwrap();
    d.drain().await;

    clock.advance(Duration::seconds(30));
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Active".to_string(), true));

    let pending = h.service.workflow_status(&poll.id).await.unwrap().pending;
    assert_eq!(pending.len(), 1, "workflow forked: {pending:?}");
}

#[tokio::test]
async fn test_moving_end_earlier_expires_active_poll() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let h = harness(clock.clone());
    let d = driver(h.service.worker_context());

    let poll = h
        .service
        .create_poll(new_poll(start, Duration::seconds(5), Duration::seconds(1200)))
        .await
        .unwrap();
    d.drain().await;
    clock.advance(Duration::seconds(6));
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Active".to_string(), true));

    let mut edited = h.service.get_poll(&poll.id).await.unwrap();
    edited.end_time = start + Duration::seconds(20);
    h.service.update_poll(edited).await.unwrap();
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await.0, "Active");

    clock.advance(Duration::seconds(20));
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Expired".to_string(), false));
    assert!(matches!(
        h.service.submit_vote(&poll.id, "1").await.unwrap_err(),
        pollster_core::CoreError::PollNotActive { .. }
    ));
    let workflow = h.service.workflow_status(&poll.id).await.unwrap().workflow.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_activation_after_window_closed_fails_workflow() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let h = harness(clock.clone());
    let d = driver(h.service.worker_context());

    let poll = h
        .service
        .create_poll(new_poll(start, Duration::seconds(5), Duration::seconds(10)))
        .await
        .unwrap();

    // Nothing ran until after the window closed.
    clock.advance(Duration::seconds(30));
    d.drain().await;

    let status = h.service.workflow_status(&poll.id).await.unwrap();
    assert_eq!(status.state, PollState::Scheduled);
    let workflow = status.workflow.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow
        .failure_reason
        .unwrap()
        .contains("End time has already passed"));
    assert!(h.notifier.published().is_empty());
    assert!(h.service.feed().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_poll_fails_its_workflow() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let h = harness(clock.clone());
    let d = driver(h.service.worker_context());

    let poll = h
        .service
        .create_poll(new_poll(start, Duration::seconds(5), Duration::seconds(10)))
        .await
        .unwrap();
    d.drain().await;
    h.service.delete_poll(&poll.id).await.unwrap();

    clock.advance(Duration::seconds(6));
    d.drain().await;

    let ctx = h.service.worker_context();
    let workflow = ctx.queue.workflow(&poll.id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(ctx.queue.pending(&poll.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_publish_failure_is_retried() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let h = harness(clock.clone());
    let d = driver(h.service.worker_context());

    let poll = h
        .service
        .create_poll(new_poll(start, Duration::seconds(5), Duration::seconds(60)))
        .await
        .unwrap();
    d.drain().await;

    h.notifier.fail_next_publishes(1);
    clock.advance(Duration::seconds(6));
    d.drain().await;
    assert_eq!(state_and_marker(&h.db, &poll.id).await, ("Active".to_string(), true));
    assert!(h.notifier.published().is_empty());

    // Default backoff starts at 500ms.
    clock.advance(Duration::seconds(1));
    d.drain().await;
    assert_eq!(h.notifier.published().len(), 1);
    let status = h.service.workflow_status(&poll.id).await.unwrap();
    assert_eq!(status.workflow.unwrap().status, WorkflowStatus::Running);
    assert_eq!(status.pending.len(), 1);
}

#[tokio::test]
async fn test_recover_schedules_orphaned_polls() {
    let h = harness(Arc::new(SystemClock));
    let now = Utc::now();
    let saved = h
        .service
        .repository()
        .put(common::definition(now, &[("a", "Red"), ("b", "Blue")]))
        .await
        .unwrap();

    let ctx = h.service.worker_context();
    assert!(ctx.queue.workflow(&saved.poll.id).await.unwrap().is_none());
    assert_eq!(h.service.recover().await.unwrap(), 1);
    assert_eq!(h.service.recover().await.unwrap(), 0);
    assert_eq!(
        ctx.queue.workflow(&saved.poll.id).await.unwrap().unwrap().status,
        WorkflowStatus::Running
    );
}
