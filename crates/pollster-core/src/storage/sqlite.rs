//! Shared SQLite connection handle.
//!
//! rusqlite is synchronous, so every query runs on
//! `tokio::task::spawn_blocking` against a connection guarded by a mutex.
//! The poll store and the task queue can share one handle or open their own
//! against the same file; WAL mode and a busy timeout let several processes
//! work on the same database.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::Connection;

use super::migrations;
use crate::error::{CoreError, DatabaseError, Result};

const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Clone)]
pub struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHandle {
    /// Open (and migrate) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        Self::configure(conn, path.to_path_buf())
    }

    /// Open an in-memory database (tests and dry runs).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| DatabaseError::OpenFailed {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::configure(conn, PathBuf::from(":memory:"))
    }

    fn configure(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")?;
        migrations::migrate(&conn).map_err(|e| {
            DatabaseError::MigrationFailed(format!("{}: {e}", path.display()))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(CoreError::from)?
    }
}

/// Format a timestamp for a TEXT column. Fixed millisecond precision keeps
/// lexicographic order equal to chronological order.
pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt(format!("timestamp '{value}': {e}")).into())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_handle_is_migrated() {
        let handle = SqliteHandle::open_memory().unwrap();
        let version = handle
            .run(|conn| Ok(migrations::get_schema_version(conn)))
            .await
            .unwrap();
        assert_eq!(version, migrations::CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn file_handle_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pollster.db");
        SqliteHandle::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn time_text_round_trips_at_millisecond_precision() {
        let at = from_millis(1_700_000_000_123);
        assert_eq!(format_time(at), "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_time(&format_time(at)).unwrap(), at);
        assert!(parse_time("yesterday").is_err());
    }
}
