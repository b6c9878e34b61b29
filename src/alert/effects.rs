//! Post-commit side effects of an evaluation run.
//!
//! The evaluator only describes what should happen once its writes are
//! committed; [`EffectRunner`] carries it out. A failed notification is logged
//! and recorded in the activity log but never undoes the alert event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::alert::notifier::Notifier;
use crate::broadcast::Broadcaster;
use crate::storage::{Comparator, Event, EventKind, EventSeverity, EventStore};

const EFFECTS_EVENT_SOURCE: &str = "alert.notifier";

/// Payload handed to a [`Notifier`] for a newly created alert event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    pub event_id: i64,
    pub condition_id: i64,
    pub condition_name: String,
    pub host: String,
    pub field_name: String,
    pub comparator: Comparator,
    pub threshold: String,
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
    pub recipients: Vec<String>,
}

/// A side effect to run after the evaluation's writes are committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a notification for a new alert event.
    Notify(AlertNotification),
    /// Publish a message on a broadcast channel.
    Broadcast { channel: String, message: Value },
}

/// Counters describing an effect run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EffectSummary {
    pub notified: usize,
    pub notify_failed: usize,
    pub broadcasts: usize,
    /// Subscriber deliveries across all broadcasts.
    pub delivered: usize,
}

/// Executes [`Effect`]s against the notifier and the broadcaster.
#[derive(Clone)]
pub struct EffectRunner {
    notifier: Arc<dyn Notifier>,
    broadcaster: Broadcaster,
    events: EventStore,
}

impl std::fmt::Debug for EffectRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectRunner")
            .field("notifier", &self.notifier.name())
            .finish_non_exhaustive()
    }
}

impl EffectRunner {
    pub fn new(notifier: Arc<dyn Notifier>, broadcaster: Broadcaster, events: EventStore) -> Self {
        Self {
            notifier,
            broadcaster,
            events,
        }
    }

    /// Run effects in order. Never fails: errors are logged and recorded.
    pub async fn run(&self, effects: Vec<Effect>) -> EffectSummary {
        let mut summary = EffectSummary::default();

        for effect in effects {
            match effect {
                Effect::Notify(notification) => {
                    match self.notifier.notify(&notification).await {
                        Ok(()) => summary.notified += 1,
                        Err(e) => {
                            summary.notify_failed += 1;
                            tracing::warn!(
                                notifier = self.notifier.name(),
                                event_id = notification.event_id,
                                error = %e,
                                "Alert notification failed"
                            );
                            self.record_failure(&notification, &e.to_string()).await;
                        }
                    }
                }
                Effect::Broadcast { channel, message } => {
                    summary.broadcasts += 1;
                    summary.delivered += self.broadcaster.publish(&channel, message);
                }
            }
        }

        summary
    }

    async fn record_failure(&self, notification: &AlertNotification, error: &str) {
        let event = Event::new(
            EFFECTS_EVENT_SOURCE,
            EventKind::Error,
            EventSeverity::Warn,
            format!(
                "Notification for alert event {} failed",
                notification.event_id
            ),
        )
        .with_payload("notifier", self.notifier.name())
        .with_payload("event_id", notification.event_id)
        .with_payload("condition", notification.condition_name.clone())
        .with_payload("error", error);

        if let Err(e) = self.events.insert(&event).await {
            tracing::warn!(error = %e, "Failed to record notification failure");
        }
    }
}
