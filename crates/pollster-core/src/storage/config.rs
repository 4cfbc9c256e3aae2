//! TOML-based service configuration.
//!
//! Covers:
//! - Database location
//! - Worker counts, task leases and idle polling
//! - Retry/backoff for failed tasks
//! - Voting rules
//! - Notification topics and the optional webhook sink
//!
//! Configuration is stored at `~/.config/pollster/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file. Relative paths resolve against the data directory.
    #[serde(default = "default_database")]
    pub database: String,
}

/// Worker pool and task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_2")]
    pub decider_workers: u32,
    #[serde(default = "default_2")]
    pub activity_workers: u32,
    /// How long a claimed task stays invisible to other workers.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Upper bound on an idle worker's sleep before it re-checks the queue.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingConfig {
    /// Reject votes unless the poll is `Active`.
    #[serde(default = "default_true")]
    pub require_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// When set, announcements are POSTed here instead of only being logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Service configuration.
///
/// Serialized to/from TOML at `~/.config/pollster/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub voting: VotingConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

// Default functions
fn default_database() -> String {
    "pollster.db".into()
}
fn default_2() -> u32 {
    2
}
fn default_lease_secs() -> u64 {
    300
}
fn default_idle_poll_ms() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_topic_prefix() -> String {
    "pollster-poll-".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decider_workers: 2,
            activity_workers: 2,
            lease_secs: default_lease_secs(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            require_active: true,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            webhook_url: None,
        }
    }
}

impl NotificationsConfig {
    /// Topic name for a poll, e.g. `pollster-poll-<id>`.
    pub fn topic_for(&self, poll_id: &str) -> String {
        format!("{}{poll_id}", self.topic_prefix)
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };
        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(invalid("config key is empty".into()));
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current
                    .as_object_mut()
                    .ok_or_else(|| invalid("unknown config key".into()))?;
                let existing = obj
                    .get(part)
                    .ok_or_else(|| invalid("unknown config key".into()))?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(format!("'{value}': {e}")))?,
                    ),
                    serde_json::Value::Number(_) => value
                        .parse::<u64>()
                        .map(|n| serde_json::Value::Number(n.into()))
                        .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?,
                    serde_json::Value::Object(_) => {
                        return Err(invalid("cannot replace a whole section".into()))
                    }
                    // Optional fields: an empty string clears them.
                    serde_json::Value::Null if value.is_empty() => serde_json::Value::Null,
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current
                .get_mut(part)
                .ok_or_else(|| invalid("unknown config key".into()))?;
        }

        Err(invalid("unknown config key".into()))
    }

    /// Location of `config.toml`.
    pub fn path() -> Result<PathBuf> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the data directory, writing the defaults on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    /// Load from an explicit path, writing the defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config =
                    toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                cfg.check()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    /// Persist to the data directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key without saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut json = serde_json::to_value(&*self)?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        updated.check()?;
        *self = updated;
        Ok(())
    }

    /// Set a config value by key and save to the data directory.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Resolved database file path.
    pub fn database_path(&self) -> Result<PathBuf> {
        let configured = PathBuf::from(&self.storage.database);
        if configured.is_absolute() {
            Ok(configured)
        } else {
            Ok(data_dir()?.join(configured))
        }
    }

    fn check(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("scheduler.decider_workers", self.scheduler.decider_workers as u64),
            ("scheduler.activity_workers", self.scheduler.activity_workers as u64),
            ("scheduler.lease_secs", self.scheduler.lease_secs),
            ("scheduler.idle_poll_ms", self.scheduler.idle_poll_ms),
            ("retry.max_attempts", self.retry.max_attempts as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".into(),
                });
            }
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "retry.backoff_max_ms".into(),
                message: "must not be smaller than retry.backoff_base_ms".into(),
            });
        }
        if let Some(url) = &self.notifications.webhook_url {
            url::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                key: "notifications.webhook_url".into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}
