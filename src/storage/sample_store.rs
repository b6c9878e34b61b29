//! Telemetry sample storage.
//!
//! Samples are append-only. Each batch is written in its own transaction and
//! duplicates (same host, kind, entity and capture time) are skipped.
//! Elements of one batch that share an entity are told apart by their
//! occurrence order, so a re-delivered batch still collides row for row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{HostSample, SampleKind, SamplePayload, from_micros, to_micros};

const DEFAULT_LIMIT: u32 = 1_000;
const MAX_LIMIT: u32 = 50_000;

/// Outcome of a batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    /// Rows written.
    pub inserted: u64,
    /// Rows skipped because an identical sample already existed.
    pub duplicates: u64,
}

/// Query for samples, newest first.
#[derive(Debug, Clone, Default)]
pub struct SampleQuery {
    pub kind: Option<SampleKind>,
    pub metric: Option<String>,
    pub hostname: Option<String>,
    /// Only samples captured at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Telemetry sample storage facade.
#[derive(Clone)]
pub struct SampleStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore").finish_non_exhaustive()
    }
}

impl SampleStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch of samples inside a single transaction.
    ///
    /// Either every new sample of the batch is written or none is.
    pub async fn insert_batch(&self, samples: &[HostSample]) -> Result<InsertOutcome, StorageError> {
        let mut outcome = InsertOutcome::default();
        if samples.is_empty() {
            return Ok(outcome);
        }

        let received_at = to_micros(Utc::now());
        let mut seen: HashMap<(&str, SampleKind, String, DateTime<Utc>), u32> = HashMap::new();
        let mut tx = self.pool.inner().begin().await?;

        for sample in samples {
            let entity = sample.payload.entity();
            let occurrence = seen
                .entry((sample.hostname.as_str(), sample.kind(), entity.clone(), sample.captured_at))
                .and_modify(|n| *n += 1)
                .or_insert(0);
            let entity = match *occurrence {
                0 => entity,
                n => format!("{entity}#{n}"),
            };

            let payload = serde_json::to_string(&sample.payload)?;
            let result = sqlx::query(
                "INSERT INTO host_samples
                     (hostname, captured_at, kind, entity, metric, value, payload, received_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (hostname, kind, entity, captured_at) DO NOTHING",
            )
            .bind(&sample.hostname)
            .bind(to_micros(sample.captured_at))
            .bind(sample.kind().as_ref())
            .bind(entity)
            .bind(sample.payload.metric())
            .bind(sample.payload.primary_value())
            .bind(payload)
            .bind(received_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Query samples with filters, ordered by capture time descending.
    pub async fn query(&self, q: SampleQuery) -> Result<Vec<HostSample>, StorageError> {
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT id, hostname, captured_at, payload FROM host_samples WHERE 1 = 1",
        );
        if let Some(kind) = q.kind {
            qb.push(" AND kind = ").push_bind(kind.as_ref().to_string());
        }
        if let Some(metric) = q.metric {
            qb.push(" AND metric = ").push_bind(metric);
        }
        if let Some(hostname) = q.hostname {
            qb.push(" AND hostname = ").push_bind(hostname);
        }
        if let Some(since) = q.since {
            qb.push(" AND captured_at >= ").push_bind(to_micros(since));
        }
        qb.push(" ORDER BY captured_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_sample).collect()
    }

    /// Count stored samples, optionally restricted to one kind.
    pub async fn count(&self, kind: Option<SampleKind>) -> Result<i64, StorageError> {
        let count: i64 = match kind {
            Some(kind) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM host_samples WHERE kind = ?")
                    .bind(kind.as_ref())
                    .fetch_one(self.pool.inner())
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM host_samples")
                    .fetch_one(self.pool.inner())
                    .await?
            }
        };
        Ok(count)
    }
}

fn row_to_sample(row: &SqliteRow) -> Result<HostSample, StorageError> {
    let payload: String = row.try_get("payload")?;
    let payload: SamplePayload = serde_json::from_str(&payload)?;
    Ok(HostSample {
        id: Some(row.try_get("id")?),
        hostname: row.try_get("hostname")?,
        captured_at: from_micros(row.try_get("captured_at")?),
        payload,
    })
}
