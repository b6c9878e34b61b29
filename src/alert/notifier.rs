//! Outbound alert notifications.
//!
//! The dispatcher is a narrow trait so transports can be swapped: the
//! built-in implementations log the alert or relay it as JSON to a webhook
//! (for instance a mail gateway).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::alert::effects::AlertNotification;

/// Default webhook request timeout.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by a notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Request could not be sent or timed out.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Receiver answered with a non-success status.
    #[error("receiver rejected notification with status {status}")]
    Rejected { status: u16 },
}

/// Delivers alert notifications to recipients.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Deliver one notification.
    async fn notify(&self, notification: &AlertNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, n: &AlertNotification) -> Result<(), NotifyError> {
        tracing::info!(
            event_id = n.event_id,
            condition = %n.condition_name,
            host = %n.host,
            recipients = ?n.recipients,
            reason = %n.reason,
            "Alert triggered"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, n: &AlertNotification) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(n).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }
        tracing::debug!(event_id = n.event_id, url = %self.url, "Alert relayed to webhook");
        Ok(())
    }
}
