//! SQLite-backed [`PollStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::sqlite::{format_time, parse_time, SqliteHandle};
use super::PollStore;
use crate::error::{CoreError, DatabaseError, Result};
use crate::poll::{ActivePollMarker, PollDefinition, PollOption, PollState, Tally};

const POLL_COLUMNS: &str =
    "id, author, title, question, start_time, end_time, state, topic, announced, created_at";

pub struct SqlitePollStore {
    db: SqliteHandle,
}

impl SqlitePollStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    /// Fresh in-memory store (for tests).
    pub fn open_memory() -> Result<Self> {
        Ok(Self::new(SqliteHandle::open_memory()?))
    }

    pub fn handle(&self) -> &SqliteHandle {
        &self.db
    }
}

/// Raw `polls` row before options are attached.
struct PollRow {
    id: String,
    author: String,
    title: String,
    question: String,
    start_time: String,
    end_time: String,
    state: String,
    topic: Option<String>,
    announced: Option<String>,
    created_at: String,
}

fn read_poll_row(row: &rusqlite::Row) -> rusqlite::Result<PollRow> {
    Ok(PollRow {
        id: row.get(0)?,
        author: row.get(1)?,
        title: row.get(2)?,
        question: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        state: row.get(6)?,
        topic: row.get(7)?,
        announced: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn parse_state(value: &str) -> Result<PollState> {
    value
        .parse()
        .map_err(|_| DatabaseError::Corrupt(format!("poll state '{value}'")).into())
}

fn load_options(conn: &Connection, poll_id: &str) -> Result<BTreeMap<String, PollOption>> {
    let mut stmt = conn.prepare_cached(
        "SELECT option_id, text, votes FROM poll_options WHERE poll_id = ?1",
    )?;
    let rows = stmt.query_map(params![poll_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            PollOption {
                text: row.get(1)?,
                votes: row.get::<_, i64>(2)?.max(0) as u64,
            },
        ))
    })?;
    let mut options = BTreeMap::new();
    for row in rows {
        let (id, option) = row?;
        options.insert(id, option);
    }
    Ok(options)
}

fn hydrate(conn: &Connection, row: PollRow) -> Result<PollDefinition> {
    let options = load_options(conn, &row.id)?;
    Ok(PollDefinition {
        options,
        author: row.author,
        title: row.title,
        question: row.question,
        start_time: parse_time(&row.start_time)?,
        end_time: parse_time(&row.end_time)?,
        state: parse_state(&row.state)?,
        topic: row.topic,
        announced: row.announced.as_deref().map(parse_state).transpose()?,
        created_at: parse_time(&row.created_at)?,
        id: row.id,
    })
}

fn get_poll(conn: &Connection, id: &str) -> Result<Option<PollDefinition>> {
    let row = conn
        .query_row(
            &format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = ?1"),
            params![id],
            read_poll_row,
        )
        .optional()?;
    row.map(|row| hydrate(conn, row)).transpose()
}

fn query_polls(conn: &Connection, filter: &str, arg: &str) -> Result<Vec<PollDefinition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POLL_COLUMNS} FROM polls WHERE {filter} = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![arg], read_poll_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(|row| hydrate(conn, row)).collect()
}

fn current_state(conn: &Connection, id: &str) -> Result<PollState> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM polls WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    match state {
        Some(state) => parse_state(&state),
        None => Err(CoreError::poll_not_found(id)),
    }
}

#[async_trait]
impl PollStore for SqlitePollStore {
    async fn get(&self, id: &str) -> Result<Option<PollDefinition>> {
        let id = id.to_string();
        self.db.run(move |conn| get_poll(conn, &id)).await
    }

    async fn upsert(&self, poll: &PollDefinition) -> Result<bool> {
        let poll = poll.clone();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existed: bool = tx
                    .query_row("SELECT 1 FROM polls WHERE id = ?1", params![poll.id], |_| {
                        Ok(true)
                    })
                    .optional()?
                    .unwrap_or(false);

                tx.execute(
                    "INSERT INTO polls (id, author, title, question, start_time, end_time,
                                        state, topic, announced, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                         author = excluded.author,
                         title = excluded.title,
                         question = excluded.question,
                         start_time = excluded.start_time,
                         end_time = excluded.end_time,
                         topic = COALESCE(polls.topic, excluded.topic)",
                    params![
                        poll.id,
                        poll.author,
                        poll.title,
                        poll.question,
                        format_time(poll.start_time),
                        format_time(poll.end_time),
                        poll.state.as_str(),
                        poll.topic,
                        poll.announced.map(PollState::as_str),
                        format_time(poll.created_at),
                    ],
                )?;

                for (option_id, option) in &poll.options {
                    tx.execute(
                        "INSERT INTO poll_options (poll_id, option_id, text, votes)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(poll_id, option_id) DO UPDATE SET text = excluded.text",
                        params![poll.id, option_id, option.text, option.votes as i64],
                    )?;
                }

                tx.commit()?;
                Ok(!existed)
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                let removed = conn.execute("DELETE FROM polls WHERE id = ?1", params![id])?;
                Ok(removed > 0)
            })
            .await
    }

    async fn query_by_author(&self, author: &str) -> Result<Vec<PollDefinition>> {
        let author = author.to_string();
        self.db
            .run(move |conn| query_polls(conn, "author", &author))
            .await
    }

    async fn list_by_state(&self, state: PollState) -> Result<Vec<PollDefinition>> {
        self.db
            .run(move |conn| query_polls(conn, "state", state.as_str()))
            .await
    }

    async fn list_active(&self) -> Result<Vec<ActivePollMarker>> {
        self.db
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, activated_at FROM active_polls ORDER BY activated_at, id",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .map(|(id, at)| {
                        Ok(ActivePollMarker {
                            id,
                            activated_at: parse_time(&at)?,
                        })
                    })
                    .collect()
            })
            .await
    }

    async fn advance_state(&self, id: &str, from: PollState, to: PollState) -> Result<()> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                if !from.can_advance_to(to) {
                    return Err(CoreError::Conflict {
                        id,
                        expected: from,
                        actual: to,
                    });
                }
                let changed = conn.execute(
                    "UPDATE polls SET state = ?3 WHERE id = ?1 AND state = ?2",
                    params![id, from.as_str(), to.as_str()],
                )?;
                if changed == 1 {
                    return Ok(());
                }
                let actual = current_state(conn, &id)?;
                Err(CoreError::Conflict {
                    id,
                    expected: from,
                    actual,
                })
            })
            .await
    }

    async fn activate(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let state = current_state(&tx, &id)?;
                let transitioned = match state {
                    PollState::Active => false,
                    PollState::Scheduled => {
                        tx.execute(
                            "UPDATE polls SET state = 'Active' WHERE id = ?1",
                            params![id],
                        )?;
                        true
                    }
                    actual => {
                        return Err(CoreError::Conflict {
                            id,
                            expected: PollState::Scheduled,
                            actual,
                        })
                    }
                };
                // Heals a missing marker on replay; never duplicates one.
                tx.execute(
                    "INSERT INTO active_polls (id, activated_at) VALUES (?1, ?2)
                     ON CONFLICT(id) DO NOTHING",
                    params![id, format_time(at)],
                )?;
                tx.commit()?;
                Ok(transitioned)
            })
            .await
    }

    async fn expire(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let state = current_state(&tx, &id)?;
                let transitioned = match state {
                    PollState::Expired => false,
                    PollState::Active => {
                        tx.execute(
                            "UPDATE polls SET state = 'Expired' WHERE id = ?1",
                            params![id],
                        )?;
                        true
                    }
                    actual => {
                        return Err(CoreError::Conflict {
                            id,
                            expected: PollState::Active,
                            actual,
                        })
                    }
                };
                tx.execute("DELETE FROM active_polls WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(transitioned)
            })
            .await
    }

    async fn mark_announced(&self, id: &str, state: PollState) -> Result<()> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                let changed = conn.execute(
                    "UPDATE polls SET announced = ?2 WHERE id = ?1",
                    params![id, state.as_str()],
                )?;
                if changed == 0 {
                    return Err(CoreError::poll_not_found(id));
                }
                Ok(())
            })
            .await
    }

    async fn increment_vote(
        &self,
        id: &str,
        option_id: &str,
        require_active: bool,
    ) -> Result<Tally> {
        let id = id.to_string();
        let option_id = option_id.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE poll_options SET votes = votes + 1
                     WHERE poll_id = ?1 AND option_id = ?2
                       AND (?3 = 0 OR EXISTS (
                           SELECT 1 FROM polls WHERE id = ?1 AND state = 'Active'))",
                    params![id, option_id, require_active],
                )?;

                if changed == 0 {
                    let state = current_state(&tx, &id)?;
                    let option_exists = tx
                        .query_row(
                            "SELECT 1 FROM poll_options WHERE poll_id = ?1 AND option_id = ?2",
                            params![id, option_id],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();
                    if !option_exists {
                        return Err(CoreError::option_not_found(option_id));
                    }
                    return Err(CoreError::PollNotActive { id, state });
                }

                let tally = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT option_id, votes FROM poll_options WHERE poll_id = ?1",
                    )?;
                    let rows = stmt.query_map(params![id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
                    })?;
                    rows.collect::<rusqlite::Result<Tally>>()?
                };
                tx.commit()?;
                Ok(tally)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::NewPoll;
    use chrono::Duration;

    fn sample(id: &str, author: &str) -> PollDefinition {
        let now = Utc::now();
        let mut poll = NewPoll {
            title: "Colours".into(),
            question: "Favourite colour?".into(),
            options: vec!["Red".into(), "Blue".into()],
            author: author.into(),
            start_time: now + Duration::seconds(10),
            end_time: now + Duration::seconds(20),
        }
        .into_definition(now);
        poll.id = id.into();
        poll
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let store = SqlitePollStore::open_memory().unwrap();
        let poll = sample("p1", "a@example.com");
        assert!(store.upsert(&poll).await.unwrap());

        let loaded = store.get("p1").await.unwrap().unwrap();
        assert_eq!(loaded.title, poll.title);
        assert_eq!(loaded.options, poll.options);
        assert_eq!(loaded.state, PollState::Unscheduled);
        assert_eq!(loaded.start_time, parse_time(&format_time(poll.start_time)).unwrap());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_twice_updates_without_touching_state_or_votes() {
        let store = SqlitePollStore::open_memory().unwrap();
        let mut poll = sample("p1", "a@example.com");
        store.upsert(&poll).await.unwrap();
        store
            .advance_state("p1", PollState::Unscheduled, PollState::Scheduled)
            .await
            .unwrap();
        store.activate("p1", Utc::now()).await.unwrap();
        store.increment_vote("p1", "1", true).await.unwrap();

        poll.title = "Renamed".into();
        assert!(!store.upsert(&poll).await.unwrap());

        let loaded = store.get("p1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.state, PollState::Active);
        assert_eq!(loaded.options["1"].votes, 1);
    }

    #[tokio::test]
    async fn query_by_author_filters() {
        let store = SqlitePollStore::open_memory().unwrap();
        store.upsert(&sample("p1", "a@example.com")).await.unwrap();
        store.upsert(&sample("p2", "b@example.com")).await.unwrap();
        store.upsert(&sample("p3", "a@example.com")).await.unwrap();

        let ids: Vec<_> = store
            .query_by_author("a@example.com")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn advance_state_rejects_stale_source_state() {
        let store = SqlitePollStore::open_memory().unwrap();
        store.upsert(&sample("p1", "a@example.com")).await.unwrap();
        store
            .advance_state("p1", PollState::Unscheduled, PollState::Scheduled)
            .await
            .unwrap();

        let err = store
            .advance_state("p1", PollState::Unscheduled, PollState::Scheduled)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                actual: PollState::Scheduled,
                ..
            }
        ));

        let backwards = store
            .advance_state("p1", PollState::Scheduled, PollState::Unscheduled)
            .await
            .unwrap_err();
        assert!(matches!(backwards, CoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn activate_and_expire_keep_marker_in_step_with_state() {
        let store = SqlitePollStore::open_memory().unwrap();
        store.upsert(&sample("p1", "a@example.com")).await.unwrap();

        let err = store.activate("p1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert!(store.list_active().await.unwrap().is_empty());

        store
            .advance_state("p1", PollState::Unscheduled, PollState::Scheduled)
            .await
            .unwrap();
        assert!(store.activate("p1", Utc::now()).await.unwrap());
        assert!(!store.activate("p1", Utc::now()).await.unwrap());
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        assert!(store.expire("p1").await.unwrap());
        assert!(!store.expire("p1").await.unwrap());
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(
            store.get("p1").await.unwrap().unwrap().state,
            PollState::Expired
        );
    }

    #[tokio::test]
    async fn list_active_orders_by_activation_time() {
        let store = SqlitePollStore::open_memory().unwrap();
        let base = Utc::now();
        for (id, offset) in [("late", 5), ("early", 1), ("mid", 3)] {
            store.upsert(&sample(id, "a@example.com")).await.unwrap();
            store
                .advance_state(id, PollState::Unscheduled, PollState::Scheduled)
                .await
                .unwrap();
            store
                .activate(id, base + Duration::seconds(offset))
                .await
                .unwrap();
        }
        let ids: Vec<_> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[tokio::test]
    async fn vote_requires_active_poll_and_known_option() {
        let store = SqlitePollStore::open_memory().unwrap();
        store.upsert(&sample("p1", "a@example.com")).await.unwrap();

        let err = store.increment_vote("p1", "1", true).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::PollNotActive {
                state: PollState::Unscheduled,
                ..
            }
        ));
        let tally = store.increment_vote("p1", "1", false).await.unwrap();
        assert_eq!(tally["1"], 1);

        let err = store.increment_vote("p1", "9", false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "Option", .. }));
        let err = store.increment_vote("nope", "1", false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "Poll", .. }));
    }

    #[tokio::test]
    async fn delete_removes_marker_and_options() {
        let store = SqlitePollStore::open_memory().unwrap();
        store.upsert(&sample("p1", "a@example.com")).await.unwrap();
        store
            .advance_state("p1", PollState::Unscheduled, PollState::Scheduled)
            .await
            .unwrap();
        store.activate("p1", Utc::now()).await.unwrap();

        assert!(store.delete("p1").await.unwrap());
        assert!(!store.delete("p1").await.unwrap());
        assert!(store.list_active().await.unwrap().is_empty());
        let orphans: i64 = store
            .handle()
            .run(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM poll_options", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
