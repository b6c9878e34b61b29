//! Alert event storage.
//!
//! At most one unresolved event exists per dedup key. Creation and resolution
//! are single conditional statements so concurrent evaluators and resolvers
//! cannot break that invariant.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{from_micros, to_micros};

const EVENT_COLUMNS: &str = "id, condition_id, host, dedup_key, triggered_at, resolved_at, resolved_by, notes, reason, payload";

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;

/// Build the dedup key of an alert for a condition and host.
pub fn dedup_key(condition_id: i64, host: &str) -> String {
    format!("{condition_id}:{host}")
}

/// An alert event stored in the `alert_events` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: i64,
    pub condition_id: i64,
    pub host: String,
    pub dedup_key: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notes: Option<String>,
    /// Evaluator explanation of why the event was raised.
    pub reason: String,
    /// Supporting sample snapshot.
    pub payload: serde_json::Value,
}

impl AlertEvent {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// An alert event to create.
#[derive(Debug, Clone)]
pub struct NewAlertEvent {
    pub condition_id: i64,
    pub host: String,
    pub triggered_at: DateTime<Utc>,
    pub reason: String,
    pub payload: serde_json::Value,
}

impl NewAlertEvent {
    pub fn dedup_key(&self) -> String {
        dedup_key(self.condition_id, &self.host)
    }
}

/// Query for alert events, newest first.
#[derive(Debug, Clone, Default)]
pub struct AlertEventQuery {
    /// `Some(false)` for open events only, `Some(true)` for resolved only.
    pub resolved: Option<bool>,
    pub condition_id: Option<i64>,
    pub limit: Option<u32>,
}

/// Alert event storage facade.
#[derive(Clone)]
pub struct AlertStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for AlertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertStore").finish_non_exhaustive()
    }
}

impl AlertStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomically create the event unless one is already open for its dedup key.
    ///
    /// Returns `None` when an open event already exists.
    pub async fn create_if_absent(
        &self,
        event: &NewAlertEvent,
    ) -> Result<Option<AlertEvent>, StorageError> {
        let sql = format!(
            "INSERT INTO alert_events (condition_id, host, dedup_key, triggered_at, reason, payload)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (dedup_key) WHERE resolved_at IS NULL DO NOTHING
             RETURNING {EVENT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(event.condition_id)
            .bind(&event.host)
            .bind(event.dedup_key())
            .bind(to_micros(event.triggered_at))
            .bind(&event.reason)
            .bind(event.payload.to_string())
            .fetch_optional(self.pool.inner())
            .await?;

        row.as_ref().map(row_to_event).transpose()
    }

    /// Get an event by ID.
    pub async fn get(&self, id: i64) -> Result<Option<AlertEvent>, StorageError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM alert_events WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Get the open event for a dedup key, if any.
    pub async fn find_open(&self, dedup_key: &str) -> Result<Option<AlertEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM alert_events WHERE dedup_key = ? AND resolved_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(dedup_key)
            .fetch_optional(self.pool.inner())
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Query events with filters.
    pub async fn query(&self, q: AlertEventQuery) -> Result<Vec<AlertEvent>, StorageError> {
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM alert_events WHERE 1 = 1"
        ));
        match q.resolved {
            Some(true) => {
                qb.push(" AND resolved_at IS NOT NULL");
            }
            Some(false) => {
                qb.push(" AND resolved_at IS NULL");
            }
            None => {}
        }
        if let Some(condition_id) = q.condition_id {
            qb.push(" AND condition_id = ").push_bind(condition_id);
        }
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Count unresolved events.
    pub async fn count_open(&self) -> Result<i64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM alert_events WHERE resolved_at IS NULL")
                .fetch_one(self.pool.inner())
                .await?;
        Ok(count)
    }

    /// Resolve a single open event.
    ///
    /// Fails with [`StorageError::NotFound`] if the event does not exist and
    /// [`StorageError::Conflict`] if it is already resolved.
    pub async fn resolve(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<AlertEvent, StorageError> {
        let sql = format!(
            "UPDATE alert_events SET resolved_at = ?, resolved_by = ?, notes = COALESCE(?, notes)
             WHERE id = ? AND resolved_at IS NULL
             RETURNING {EVENT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(to_micros(at))
            .bind(resolved_by)
            .bind(notes)
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;

        match row {
            Some(row) => row_to_event(&row),
            None => match self.get(id).await? {
                Some(_) => Err(StorageError::Conflict(format!(
                    "alert event {id} is already resolved"
                ))),
                None => Err(StorageError::NotFound(format!("alert event {id}"))),
            },
        }
    }

    /// Highest event ID currently stored (0 when empty).
    pub async fn high_water_mark(&self) -> Result<i64, StorageError> {
        let mark: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM alert_events")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(mark.unwrap_or(0))
    }

    /// Resolve every open event whose ID is at most `mark`.
    ///
    /// Events created after the mark was taken stay open. Returns the number of
    /// events resolved.
    pub async fn resolve_open_through(
        &self,
        mark: i64,
        resolved_by: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE alert_events SET resolved_at = ?, resolved_by = ?, notes = ?
             WHERE resolved_at IS NULL AND id <= ?",
        )
        .bind(to_micros(at))
        .bind(resolved_by)
        .bind(notes)
        .bind(mark)
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_event(row: &SqliteRow) -> Result<AlertEvent, StorageError> {
    let payload: String = row.try_get("payload")?;
    Ok(AlertEvent {
        id: row.try_get("id")?,
        condition_id: row.try_get("condition_id")?,
        host: row.try_get("host")?,
        dedup_key: row.try_get("dedup_key")?,
        triggered_at: from_micros(row.try_get("triggered_at")?),
        resolved_at: row.try_get::<Option<i64>, _>("resolved_at")?.map(from_micros),
        resolved_by: row.try_get("resolved_by")?,
        notes: row.try_get("notes")?,
        reason: row.try_get("reason")?,
        payload: serde_json::from_str(&payload)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;

    async fn create_test_store() -> AlertStore {
        let pool = SqlitePool::connect("sqlite::memory:", 1).await.unwrap();
        init_schema(pool.inner()).await.unwrap();
        sqlx::query(
            "INSERT INTO alert_conditions (name, source, field_name, comparator, threshold, created_at, updated_at)
             VALUES ('hot', 'sensor', 'cpu_temp', '>', '90', 0, 0)",
        )
        .execute(pool.inner())
        .await
        .unwrap();
        AlertStore::new(pool)
    }

    fn new_event(host: &str) -> NewAlertEvent {
        NewAlertEvent {
            condition_id: 1,
            host: host.to_string(),
            triggered_at: Utc::now(),
            reason: "cpu_temp > 90".to_string(),
            payload: serde_json::json!({"value": 95.0}),
        }
    }

    #[tokio::test]
    async fn test_create_if_absent_dedups_open_events() {
        let store = create_test_store().await;

        let created = store.create_if_absent(&new_event("h1")).await.unwrap();
        let created = created.unwrap();
        assert_eq!(created.dedup_key, "1:h1");
        assert!(created.is_open());
        assert_eq!(created.payload["value"], 95.0);

        assert!(store.create_if_absent(&new_event("h1")).await.unwrap().is_none());
        assert!(store.create_if_absent(&new_event("h2")).await.unwrap().is_some());
        assert_eq!(store.count_open().await.unwrap(), 2);

        let open = store.find_open("1:h1").await.unwrap().unwrap();
        assert_eq!(open.id, created.id);
    }

    #[tokio::test]
    async fn test_resolve_then_recreate() {
        let store = create_test_store().await;
        let first = store.create_if_absent(&new_event("h1")).await.unwrap().unwrap();

        let resolved = store
            .resolve(first.id, "alice", Some("looked at it"), Utc::now())
            .await
            .unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));
        assert_eq!(resolved.notes.as_deref(), Some("looked at it"));
        assert!(!resolved.is_open());

        let second = store.create_if_absent(&new_event("h1")).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_resolve_missing_and_already_resolved() {
        let store = create_test_store().await;
        let err = store.resolve(99, "alice", None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        let event = store.create_if_absent(&new_event("h1")).await.unwrap().unwrap();
        store.resolve(event.id, "alice", None, Utc::now()).await.unwrap();
        let err = store.resolve(event.id, "bob", None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // First resolver wins
        let stored = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(stored.resolved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_resolve_through_mark_leaves_newer_events_open() {
        let store = create_test_store().await;
        store.create_if_absent(&new_event("h1")).await.unwrap();
        store.create_if_absent(&new_event("h2")).await.unwrap();

        let mark = store.high_water_mark().await.unwrap();
        let late = store.create_if_absent(&new_event("h3")).await.unwrap().unwrap();

        let count = store
            .resolve_open_through(mark, "alice", "ack", Utc::now())
            .await
            .unwrap();
        assert_eq!(count, 2);

        let open = store
            .query(AlertEventQuery {
                resolved: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, late.id);

        let resolved = store
            .query(AlertEventQuery {
                resolved: Some(true),
                condition_id: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|e| e.notes.as_deref() == Some("ack")));
    }

    #[tokio::test]
    async fn test_high_water_mark_empty() {
        let store = create_test_store().await;
        assert_eq!(store.high_water_mark().await.unwrap(), 0);
    }
}
