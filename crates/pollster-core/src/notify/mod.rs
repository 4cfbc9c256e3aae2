//! Notification sinks for poll announcements.
//!
//! Each poll owns one topic, created on first save, with the author
//! subscribed to it. Lifecycle announcements are published to that topic.

mod memory;
mod webhook;

pub use memory::{LogNotifier, MemoryNotifier, Published, Subscription};
pub use webhook::WebhookNotifier;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::Announcement;

/// Protocol used when subscribing a poll's author.
pub const AUTHOR_PROTOCOL: &str = "email";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Create (or look up) a topic and return its handle.
    async fn create_topic(&self, name: &str) -> Result<String>;

    async fn subscribe(&self, topic: &str, protocol: &str, endpoint: &str) -> Result<()>;

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()>;
}

/// Publish `announcement` to `topic` using its standard subject and text.
pub async fn announce(
    notifier: &dyn Notifier,
    topic: &str,
    announcement: &Announcement,
) -> Result<()> {
    notifier
        .publish(topic, &announcement.subject(), &announcement.message())
        .await
}
