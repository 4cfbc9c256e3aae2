//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pollster_core::notify::MemoryNotifier;
use pollster_core::storage::NotificationsConfig;
use pollster_core::{
    Clock, NewPoll, PollDefinition, PollOption, PollRepository, PollService, PollState,
    SqliteHandle, SqlitePollStore, SqliteTaskQueue,
};

/// A service over an in-memory database and a recording notifier.
pub struct Harness {
    pub service: PollService,
    pub notifier: Arc<MemoryNotifier>,
    pub db: SqliteHandle,
}

pub fn harness(clock: Arc<dyn Clock>) -> Harness {
    harness_on(SqliteHandle::open_memory().unwrap(), clock)
}

pub fn harness_on(db: SqliteHandle, clock: Arc<dyn Clock>) -> Harness {
    let notifier = Arc::new(MemoryNotifier::new());
    let repo = PollRepository::new(
        Arc::new(SqlitePollStore::new(db.clone())),
        notifier.clone(),
        NotificationsConfig::default(),
    );
    let queue = SqliteTaskQueue::new(db.clone(), Arc::clone(&clock));
    let service = PollService::new(repo, Arc::new(queue), clock, true);
    Harness {
        service,
        notifier,
        db,
    }
}

pub fn new_poll(now: DateTime<Utc>, start_in: Duration, end_in: Duration) -> NewPoll {
    NewPoll {
        title: "Lunch".into(),
        question: "Where should we eat?".into(),
        options: vec!["Tacos".into(), "Ramen".into()],
        author: "author@example.com".into(),
        start_time: now + start_in,
        end_time: now + end_in,
    }
}

/// A definition with caller-chosen option ids, on whole-second times.
pub fn definition(now: DateTime<Utc>, options: &[(&str, &str)]) -> PollDefinition {
    let now = DateTime::from_timestamp(now.timestamp(), 0).unwrap();
    let options: BTreeMap<String, PollOption> = options
        .iter()
        .map(|(id, text)| (id.to_string(), PollOption::new(*text)))
        .collect();
    PollDefinition {
        id: String::new(),
        author: "author@example.com".into(),
        title: "Colours".into(),
        question: "Favourite colour?".into(),
        options,
        start_time: now + Duration::seconds(60),
        end_time: now + Duration::seconds(120),
        state: PollState::Unscheduled,
        topic: None,
        announced: None,
        created_at: now,
    }
}

/// Push a stored poll straight to `Active`.
pub async fn force_active(repo: &PollRepository, id: &str, at: DateTime<Utc>) {
    repo.store()
        .advance_state(id, PollState::Unscheduled, PollState::Scheduled)
        .await
        .unwrap();
    repo.store().activate(id, at).await.unwrap();
}

/// Read state and marker presence in one statement.
pub async fn state_and_marker(db: &SqliteHandle, id: &str) -> (String, bool) {
    let id = id.to_string();
    db.run(move |conn| {
        Ok(conn.query_row(
            "SELECT state, EXISTS (SELECT 1 FROM active_polls WHERE id = ?1)
             FROM polls WHERE id = ?1",
            [&id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    })
    .await
    .unwrap()
}
