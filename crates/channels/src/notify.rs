//! Notification channels: the outbound side of an action.
//!
//! A channel is an opaque send keyed by session and action. The log channel
//! writes structured log lines, the webhook channel POSTs the notification
//! as JSON, and the recording channel keeps everything in memory for tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journey_core::types::{ActionType, Stage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// A rendered action ready to be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: Uuid,
    pub session_id: String,
    pub stage: Stage,
    pub action: ActionType,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: String,
    pub provider_message_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel rejected notification: {0}")]
    Rejected(String),
    #[error("channel transport failure: {0}")]
    Transport(String),
    #[error("channel timed out")]
    Timeout,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, ChannelError>;
}

// ─── Log channel ────────────────────────────────────────────────────────────

/// Writes every notification to the log instead of delivering it.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, ChannelError> {
        info!(
            session_id = %notification.session_id,
            stage = %notification.stage,
            action = notification.action.display_name(),
            subject = %notification.subject,
            "Stage action"
        );
        Ok(DeliveryReceipt {
            channel: self.name().to_string(),
            provider_message_id: None,
            accepted_at: Utc::now(),
        })
    }
}

// ─── Webhook channel ────────────────────────────────────────────────────────

/// POSTs notifications as JSON to an external notification service.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct WebhookAck {
    #[serde(default)]
    id: Option<String>,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let url = url.into();
        info!(url = %url, timeout_ms = timeout.as_millis() as u64, "Webhook channel initialized");
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, ChannelError> {
        debug!(
            session_id = %notification.session_id,
            action = notification.action.display_name(),
            url = %self.url,
            "Posting notification"
        );

        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout
                } else {
                    ChannelError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Rejected(format!("HTTP {status}")));
        }

        // The acknowledgement body is optional.
        let ack = response
            .json::<WebhookAck>()
            .await
            .unwrap_or(WebhookAck { id: None });

        Ok(DeliveryReceipt {
            channel: self.name().to_string(),
            provider_message_id: ack.id,
            accepted_at: Utc::now(),
        })
    }
}

// ─── Recording channel ──────────────────────────────────────────────────────

/// In-memory channel that captures notifications, optionally failing every
/// send.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Notification>>,
    attempts: Mutex<u64>,
    failing: Mutex<bool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let channel = Self::default();
        channel.set_failing(true);
        channel
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Sends attempted, successful or not.
    pub fn attempts(&self) -> u64 {
        *self.attempts.lock()
    }

    pub fn sent_for(&self, session_id: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, ChannelError> {
        *self.attempts.lock() += 1;
        if *self.failing.lock() {
            return Err(ChannelError::Transport("recording channel set to fail".into()));
        }
        self.sent.lock().push(notification.clone());
        Ok(DeliveryReceipt {
            channel: self.name().to_string(),
            provider_message_id: Some(notification.notification_id.to_string()),
            accepted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Notification {
        Notification {
            notification_id: Uuid::new_v4(),
            session_id: "s1".into(),
            stage: Stage::Awareness,
            action: ActionType::WelcomeMessage,
            subject: "hello".into(),
            body: "<p>hi</p>".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recording_channel_captures_and_fails_on_demand() {
        let channel = RecordingChannel::new();
        channel.send(&sample()).await.unwrap();
        assert_eq!(channel.sent().len(), 1);

        channel.set_failing(true);
        assert!(channel.send(&sample()).await.is_err());
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(channel.attempts(), 2);
    }

    #[tokio::test]
    async fn test_log_channel_accepts() {
        let receipt = LogChannel.send(&sample()).await.unwrap();
        assert_eq!(receipt.channel, "log");
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_transport_error() {
        let channel =
            WebhookChannel::new("http://127.0.0.1:9/hooks", Duration::from_millis(500)).unwrap();
        let err = channel.send(&sample()).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(_) | ChannelError::Timeout
        ));
    }
}
