//! Database schema definitions.
//!
//! All timestamps are stored as Unix microseconds (`INTEGER`), string enums as
//! their lowercase `strum` representation and free-form payloads as JSON text.

use sqlx::SqlitePool;

use crate::storage::StorageError;

/// Telemetry facts pushed by agents.
///
/// A sample's identity is `(hostname, kind, entity, captured_at)`; the unique
/// constraint turns re-delivery into a no-op.
pub const HOST_SAMPLES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS host_samples (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname    TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    entity      TEXT NOT NULL,
    metric      TEXT NOT NULL,
    value       REAL,
    payload     TEXT NOT NULL DEFAULT '{}',
    received_at INTEGER NOT NULL,
    UNIQUE (hostname, kind, entity, captured_at)
);
CREATE INDEX IF NOT EXISTS idx_host_samples_kind_ts ON host_samples (kind, captured_at);
"#;

/// Discovered network devices, unique by IP address.
pub const DEVICES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address    TEXT NOT NULL UNIQUE,
    mac_address   TEXT,
    name          TEXT,
    vendor        TEXT,
    status        TEXT NOT NULL DEFAULT 'online',
    notes         TEXT NOT NULL DEFAULT '',
    first_seen_at INTEGER NOT NULL,
    last_seen_at  INTEGER NOT NULL
);
"#;

/// Alert condition catalog.
pub const ALERT_CONDITIONS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS alert_conditions (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    name                 TEXT NOT NULL UNIQUE,
    source               TEXT NOT NULL,
    field_name           TEXT NOT NULL,
    comparator           TEXT NOT NULL,
    threshold            TEXT NOT NULL,
    time_window_secs     INTEGER,
    count_threshold      INTEGER,
    repeat_interval_secs INTEGER,
    enabled              INTEGER NOT NULL DEFAULT 1,
    recipients           TEXT NOT NULL DEFAULT '[]',
    last_triggered_at    INTEGER,
    created_at           INTEGER NOT NULL,
    updated_at           INTEGER NOT NULL
);
"#;

/// Alert events.
///
/// The partial unique index allows any number of resolved rows per
/// `dedup_key` but at most one unresolved row.
pub const ALERT_EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS alert_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    condition_id INTEGER NOT NULL REFERENCES alert_conditions (id),
    host         TEXT NOT NULL,
    dedup_key    TEXT NOT NULL,
    triggered_at INTEGER NOT NULL,
    resolved_at  INTEGER,
    resolved_by  TEXT,
    notes        TEXT,
    reason       TEXT NOT NULL DEFAULT '',
    payload      TEXT NOT NULL DEFAULT '{}'
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_alert_events_open
    ON alert_events (dedup_key) WHERE resolved_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_alert_events_condition ON alert_events (condition_id);
"#;

/// Activity log.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    ts       INTEGER NOT NULL,
    source   TEXT NOT NULL,
    kind     TEXT NOT NULL,
    severity TEXT NOT NULL,
    message  TEXT NOT NULL,
    payload  TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts);
"#;

/// Initialize the database schema.
///
/// Creates all necessary tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [
        HOST_SAMPLES_TABLE_DDL,
        DEVICES_TABLE_DDL,
        ALERT_CONDITIONS_TABLE_DDL,
        ALERT_EVENTS_TABLE_DDL,
        EVENTS_TABLE_DDL,
    ] {
        sqlx::raw_sql(ddl).execute(pool).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db;

    async fn create_test_pool() -> db::SqlitePool {
        let pool = db::SqlitePool::connect("sqlite::memory:", 1).await.unwrap();
        init_schema(pool.inner()).await.unwrap();
        pool
    }

    async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(pool)
                .await
                .unwrap();
        row.0 == 1
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let pool = create_test_pool().await;
        for table in [
            "host_samples",
            "devices",
            "alert_conditions",
            "alert_events",
            "events",
        ] {
            assert!(table_exists(pool.inner(), table).await, "missing {table}");
        }

        // Idempotent
        init_schema(pool.inner()).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_alert_unique_per_dedup_key() {
        let pool = create_test_pool().await;
        sqlx::query(
            "INSERT INTO alert_conditions (name, source, field_name, comparator, threshold, created_at, updated_at)
             VALUES ('hot', 'sensor', 'cpu_temp', '>', '90', 0, 0)",
        )
        .execute(pool.inner())
        .await
        .unwrap();

        let insert = "INSERT INTO alert_events (condition_id, host, dedup_key, triggered_at, resolved_at)
                      VALUES (1, 'h1', '1:h1', 0, ?)";

        // Two resolved rows for the same key are allowed
        sqlx::query(insert).bind(Some(1_i64)).execute(pool.inner()).await.unwrap();
        sqlx::query(insert).bind(Some(2_i64)).execute(pool.inner()).await.unwrap();

        // One open row is allowed, a second is rejected
        sqlx::query(insert).bind(None::<i64>).execute(pool.inner()).await.unwrap();
        let err = sqlx::query(insert)
            .bind(None::<i64>)
            .execute(pool.inner())
            .await
            .unwrap_err();
        assert!(StorageError::from(err).is_unique_violation());
    }

    #[tokio::test]
    async fn test_sample_identity_unique() {
        let pool = create_test_pool().await;
        let insert = "INSERT INTO host_samples (hostname, captured_at, kind, entity, metric, received_at)
                      VALUES ('h1', 100, 'sensor', 'cpu_temp', 'cpu_temp', 100)
                      ON CONFLICT DO NOTHING";

        let first = sqlx::query(insert).execute(pool.inner()).await.unwrap();
        let second = sqlx::query(insert).execute(pool.inner()).await.unwrap();
        assert_eq!(first.rows_affected(), 1);
        assert_eq!(second.rows_affected(), 0);
    }
}
