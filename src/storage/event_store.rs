//! Activity log storage.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use strum_macros::{AsRefStr, EnumString};

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{
    Event, EventKind, EventPayload, EventSeverity, from_micros, to_micros,
};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;
const DEFAULT_RANGE_DAYS: i64 = 30;

/// Sort order for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Query for events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub kind: Option<EventKind>,
    pub severity: Option<EventSeverity>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

/// Activity log facade.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event. Returns its ID.
    pub async fn insert(&self, event: &Event) -> Result<i64, StorageError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO events (ts, source, kind, severity, message, payload)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(to_micros(event.ts))
        .bind(&event.source)
        .bind(event.kind.as_ref())
        .bind(event.severity.as_ref())
        .bind(&event.message)
        .bind(serde_json::to_string(&event.payload)?)
        .fetch_one(self.pool.inner())
        .await?;
        Ok(id)
    }

    /// Query events with filters.
    pub async fn query(&self, q: EventQuery) -> Result<Vec<Event>, StorageError> {
        let now = Utc::now();
        let start = q
            .start
            .unwrap_or_else(|| now - Duration::days(DEFAULT_RANGE_DAYS));
        let end = q.end.unwrap_or(now);
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let order = q.order.unwrap_or_default();

        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT id, ts, source, kind, severity, message, payload FROM events WHERE ts >= ",
        );
        qb.push_bind(to_micros(start))
            .push(" AND ts <= ")
            .push_bind(to_micros(end));

        if let Some(src) = q.source {
            qb.push(" AND source = ").push_bind(src);
        }
        if let Some(kind) = q.kind {
            qb.push(" AND kind = ").push_bind(kind.as_ref().to_string());
        }
        if let Some(sev) = q.severity {
            qb.push(" AND severity = ").push_bind(sev.as_ref().to_string());
        }

        qb.push(format!(" ORDER BY ts {0}, id {0} LIMIT ", order.as_sql()))
            .push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &SqliteRow) -> Result<Event, StorageError> {
    let kind: String = row.try_get("kind")?;
    let severity: String = row.try_get("severity")?;
    let payload: String = row.try_get("payload")?;
    Ok(Event {
        id: Some(row.try_get("id")?),
        ts: from_micros(row.try_get("ts")?),
        source: row.try_get("source")?,
        kind: EventKind::from_str(&kind).unwrap_or(EventKind::System),
        severity: EventSeverity::from_str(&severity).unwrap_or(EventSeverity::Info),
        message: row.try_get("message")?,
        payload: parse_payload(&payload),
    })
}

/// Parse a stored JSON payload, falling back to an empty map.
fn parse_payload(s: &str) -> EventPayload {
    if s.is_empty() || s == "{}" {
        return EventPayload::new();
    }
    serde_json::from_str(s).unwrap_or_else(|e| {
        tracing::debug!(error = %e, raw = s, "Failed to parse event payload, returning empty");
        EventPayload::new()
    })
}
