use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use super::Notifier;
use crate::error::{CoreError, Result};

/// Writes announcements to the log. The default sink when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn create_topic(&self, name: &str) -> Result<String> {
        info!(topic = %name, "created notification topic");
        Ok(name.to_string())
    }

    async fn subscribe(&self, topic: &str, protocol: &str, endpoint: &str) -> Result<()> {
        info!(topic = %topic, protocol = %protocol, endpoint = %endpoint, "subscribed to topic");
        Ok(())
    }

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()> {
        info!(topic = %topic, subject = %subject, "{message}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub protocol: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct Recorded {
    topics: BTreeSet<String>,
    subscriptions: Vec<Subscription>,
    published: Vec<Published>,
    failures_left: u32,
}

/// Records every call. Can be told to fail the next N publishes.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    inner: Mutex<Recorded>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publish calls fail with a notification error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failures_left = count;
    }

    pub fn topics(&self) -> Vec<String> {
        self.lock().topics.iter().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Messages published to one topic, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn create_topic(&self, name: &str) -> Result<String> {
        self.lock().topics.insert(name.to_string());
        Ok(name.to_string())
    }

    async fn subscribe(&self, topic: &str, protocol: &str, endpoint: &str) -> Result<()> {
        let mut recorded = self.lock();
        if !recorded.topics.contains(topic) {
            return Err(CoreError::Notification {
                topic: topic.to_string(),
                message: "topic does not exist".into(),
            });
        }
        recorded.subscriptions.push(Subscription {
            topic: topic.to_string(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()> {
        let mut recorded = self.lock();
        if recorded.failures_left > 0 {
            recorded.failures_left -= 1;
            return Err(CoreError::Notification {
                topic: topic.to_string(),
                message: "sink unavailable".into(),
            });
        }
        recorded.published.push(Published {
            topic: topic.to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
