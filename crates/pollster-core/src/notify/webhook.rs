//! Webhook sink -- POST every notifier call as JSON.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::Notifier;
use crate::error::{ConfigError, CoreError, Result};

pub struct WebhookNotifier {
    client: Client,
    url: url::Url,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str) -> Result<Self> {
        let url = url::Url::parse(webhook_url).map_err(|e| ConfigError::InvalidValue {
            key: "notifications.webhook_url".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            client: Client::new(),
            url,
        })
    }

    async fn post(&self, topic: &str, body: Value) -> Result<()> {
        let failed = |message: String| CoreError::Notification {
            topic: topic.to_string(),
            message,
        };

        let resp = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(topic = %topic, status = status.as_u16(), "webhook accepted");
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(failed(format!("webhook error (HTTP {status}): {text}")))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn create_topic(&self, name: &str) -> Result<String> {
        self.post(name, json!({ "action": "create_topic", "topic": name }))
            .await?;
        Ok(name.to_string())
    }

    async fn subscribe(&self, topic: &str, protocol: &str, endpoint: &str) -> Result<()> {
        self.post(
            topic,
            json!({
                "action": "subscribe",
                "topic": topic,
                "protocol": protocol,
                "endpoint": endpoint,
            }),
        )
        .await
    }

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()> {
        self.post(
            topic,
            json!({
                "action": "publish",
                "topic": topic,
                "subject": subject,
                "message": message,
            }),
        )
        .await
    }
}
