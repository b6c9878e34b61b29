//! Alert resolution workflow.
//!
//! Single and bulk acknowledgement of alert events. Every resolution is
//! recorded in the activity log and announced on the alerts channel.

use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::auth::Actor;
use crate::broadcast::Broadcaster;
use crate::storage::{AlertEvent, AlertStore, Event, EventKind, EventSeverity, EventStore, StorageError};

/// Notes recorded by a bulk resolve when the caller gives none.
pub const DEFAULT_BULK_NOTES: &str = "Bulk resolved via API";

const RESOLUTION_EVENT_SOURCE: &str = "alert.resolution";

/// Errors raised by the resolution workflow.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("alert event {0} not found")]
    NotFound(i64),

    #[error("alert event {0} is already resolved")]
    AlreadyResolved(i64),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Resolves alert events on behalf of an authenticated actor.
#[derive(Debug, Clone)]
pub struct ResolutionWorkflow {
    alerts: AlertStore,
    events: EventStore,
    broadcaster: Broadcaster,
    alerts_channel: String,
}

impl ResolutionWorkflow {
    pub fn new(
        alerts: AlertStore,
        events: EventStore,
        broadcaster: Broadcaster,
        alerts_channel: impl Into<String>,
    ) -> Self {
        Self {
            alerts,
            events,
            broadcaster,
            alerts_channel: alerts_channel.into(),
        }
    }

    /// Resolve one open event.
    pub async fn resolve_one(
        &self,
        actor: &Actor,
        id: i64,
        notes: Option<&str>,
    ) -> Result<AlertEvent, ResolutionError> {
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        let event = self
            .alerts
            .resolve(id, &actor.username, notes, Utc::now())
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => ResolutionError::NotFound(id),
                StorageError::Conflict(_) => ResolutionError::AlreadyResolved(id),
                other => ResolutionError::Storage(other),
            })?;

        tracing::info!(event_id = id, actor = %actor.username, "Alert event resolved");
        self.audit(
            actor,
            "resolve",
            1,
            format!("Resolved alert event {id}"),
            json!({ "event_id": id, "condition_id": event.condition_id, "host": event.host }),
        )
        .await;
        self.announce(actor, vec![id], 1);
        Ok(event)
    }

    /// Resolve every event open at the time of the call.
    ///
    /// Events opened while the update runs keep their open state. Returns the
    /// number of events resolved.
    pub async fn resolve_all(
        &self,
        actor: &Actor,
        notes: Option<&str>,
    ) -> Result<u64, ResolutionError> {
        let mark = self.alerts.high_water_mark().await?;
        self.resolve_through(actor, mark, notes).await
    }

    /// Resolve every open event with an id at or below `mark`.
    ///
    /// `mark` is a previously taken [`AlertStore::high_water_mark`].
    pub async fn resolve_through(
        &self,
        actor: &Actor,
        mark: i64,
        notes: Option<&str>,
    ) -> Result<u64, ResolutionError> {
        let notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_BULK_NOTES);

        let count = self
            .alerts
            .resolve_open_through(mark, &actor.username, notes, Utc::now())
            .await?;

        tracing::info!(count, mark, actor = %actor.username, "Alert events bulk resolved");
        self.audit(
            actor,
            "resolve_all",
            count,
            format!("Resolved {count} alert events"),
            json!({ "high_water_mark": mark, "notes": notes }),
        )
        .await;
        if count > 0 {
            self.announce(actor, Vec::new(), count);
        }
        Ok(count)
    }

    async fn audit(
        &self,
        actor: &Actor,
        action: &str,
        affected: u64,
        message: String,
        details: serde_json::Value,
    ) {
        let event = Event::new(
            RESOLUTION_EVENT_SOURCE,
            EventKind::Audit,
            EventSeverity::Info,
            message,
        )
        .with_payload("actor", actor.username.as_str())
        .with_payload("action", action)
        .with_payload("affected", affected)
        .with_payload("details", details);

        // The resolution is already committed; a lost audit entry is only logged
        if let Err(e) = self.events.insert(&event).await {
            tracing::warn!(error = %e, action, "Failed to record audit event");
        }
    }

    fn announce(&self, actor: &Actor, event_ids: Vec<i64>, count: u64) {
        self.broadcaster.publish(
            &self.alerts_channel,
            json!({
                "type": "alert.resolved",
                "resolvedBy": actor.username,
                "eventIds": event_ids,
                "count": count,
            }),
        );
    }
}
