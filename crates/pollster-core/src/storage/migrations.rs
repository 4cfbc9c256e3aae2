//! Database schema migrations for pollster.
//!
//! Migrations are versioned and applied automatically when a connection is
//! opened. The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};
use tracing::warn;

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Returns 0 if no version is set (fresh database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: poll records, their options, and the active-poll index.
///
/// Vote counts live in `poll_options.votes` so a vote is a single-row
/// `UPDATE ... SET votes = votes + 1`.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS polls (
            id          TEXT PRIMARY KEY,
            author      TEXT NOT NULL,
            title       TEXT NOT NULL,
            question    TEXT NOT NULL,
            start_time  TEXT NOT NULL,
            end_time    TEXT NOT NULL,
            state       TEXT NOT NULL DEFAULT 'Unscheduled',
            topic       TEXT,
            announced   TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_polls_author ON polls(author);
        CREATE INDEX IF NOT EXISTS idx_polls_state ON polls(state);

        CREATE TABLE IF NOT EXISTS poll_options (
            poll_id    TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
            option_id  TEXT NOT NULL,
            text       TEXT NOT NULL,
            votes      INTEGER NOT NULL DEFAULT 0 CHECK (votes >= 0),
            PRIMARY KEY (poll_id, option_id)
        );

        CREATE TABLE IF NOT EXISTS active_polls (
            id            TEXT PRIMARY KEY REFERENCES polls(id) ON DELETE CASCADE,
            activated_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_active_polls_activated_at ON active_polls(activated_at);",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: workflow registry and the task queue.
///
/// Times are epoch milliseconds so visibility and lease comparisons are
/// plain integer comparisons.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS workflows (
            poll_id         TEXT PRIMARY KEY,
            run             INTEGER NOT NULL DEFAULT 1,
            status          TEXT NOT NULL,
            failure_reason  TEXT,
            started_at      INTEGER NOT NULL,
            closed_at       INTEGER
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            list         TEXT NOT NULL,
            workflow_id  TEXT NOT NULL,
            kind         TEXT NOT NULL,
            visible_at   INTEGER NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            lease_token  TEXT UNIQUE,
            lease_until  INTEGER,
            last_error   TEXT,
            created_at   INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_list_visible ON tasks(list, visible_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id);",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_from_scratch() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), CURRENT_SCHEMA_VERSION);

        let tables: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('polls', 'poll_options', 'active_polls', 'workflows', 'tasks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_migrate_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_incremental_migration() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema_version_table(&conn).unwrap();
        migrate_v1(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 1);

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 2);
        let has_tasks: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'tasks'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_tasks, 1);
    }
}
