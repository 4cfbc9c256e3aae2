//! Core error types for pollster-core.
//!
//! The hierarchy separates what a caller can fix (validation, not-found,
//! state conflicts) from what the task queue should retry (locked database,
//! unreachable notifier) and from what must abort a poll's workflow for good.

use std::path::PathBuf;
use thiserror::Error;

use crate::poll::PollState;

/// Core error type for pollster-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input, rejected before any state change
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Poll or option absent
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Vote submitted outside the poll's active window
    #[error("Poll '{id}' is not active (state: {state})")]
    PollNotActive { id: String, state: PollState },

    /// State precondition violated
    #[error("Conflict on poll '{id}': expected state {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: PollState,
        actual: PollState,
    },

    /// A task lease was lost before the worker acknowledged it
    #[error("Lease '{token}' is no longer held")]
    LeaseLost { token: String },

    /// Database-related errors
    #[error("Database error: {0}")]
    Storage(#[from] DatabaseError),

    /// Notification sink errors
    #[error("Notification error for topic '{topic}': {message}")]
    Notification { topic: String, message: String },

    /// Unexpected condition that aborts a poll's workflow permanently
    #[error("Workflow for poll '{poll_id}' aborted: {reason}")]
    FatalWorkflow { poll_id: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn poll_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "Poll",
            id: id.into(),
        }
    }

    pub fn option_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "Option",
            id: id.into(),
        }
    }

    pub fn fatal(poll_id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::FatalWorkflow {
            poll_id: poll_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the task queue should redeliver the failed unit of work.
    ///
    /// Only transient storage and notifier failures qualify; everything
    /// else either surfaces to the caller or terminates the workflow.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Storage(db) => db.is_transient(),
            CoreError::Notification { .. } => true,
            CoreError::Io(_) => true,
            _ => false,
        }
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// Stored data could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The blocking task running the query panicked or was cancelled
    #[error("Storage task failed: {0}")]
    TaskJoin(String),
}

impl DatabaseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Locked | DatabaseError::TaskJoin(_))
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Validation errors.
///
/// Every variant names the field it rejects so the API layer can report
/// field-level reasons.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Invalid time range
    #[error("Invalid time range: end_time ({end}) must be greater than start_time ({start})")]
    InvalidTimeRange {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    /// End time already passed
    #[error("end_time ({end}) is in the past (now: {now})")]
    EndTimeInPast {
        end: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    },

    /// Required text field is blank
    #[error("'{field}' must not be blank")]
    Blank { field: String },

    /// Empty collection
    #[error("Empty collection: {0}")]
    EmptyCollection(String),

    /// Two options share the same text
    #[error("Duplicate option '{0}'")]
    DuplicateOption(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Several independent violations
    #[error("{}", join_messages(.0))]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// The field this violation is about.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::InvalidTimeRange { .. } => "end_time",
            ValidationError::EndTimeInPast { .. } => "end_time",
            ValidationError::Blank { field } => field,
            ValidationError::EmptyCollection(_) => "options",
            ValidationError::DuplicateOption(_) => "options",
            ValidationError::InvalidValue { field, .. } => field,
            ValidationError::Multiple(_) => "*",
        }
    }

    /// Flatten into individual violations.
    pub fn violations(&self) -> Vec<&ValidationError> {
        match self {
            ValidationError::Multiple(all) => all.iter().flat_map(|v| v.violations()).collect(),
            single => vec![single],
        }
    }

    /// Collapse a list of violations into one error, or `None` when empty.
    pub fn collect(mut violations: Vec<ValidationError>) -> Option<ValidationError> {
        match violations.len() {
            0 => None,
            1 => violations.pop(),
            _ => Some(ValidationError::Multiple(violations)),
        }
    }
}

fn join_messages(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => DatabaseError::Corrupt(err.to_string()),
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.into())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::Storage(DatabaseError::TaskJoin(err.to_string()))
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
