//! Alert condition catalog storage and synchronization.
//!
//! Provides CRUD operations for alert conditions and the insert-if-absent
//! sync of config-file conditions on startup.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{Comparator, SampleKind, from_micros, to_micros};

const CONDITION_COLUMNS: &str = "id, name, source, field_name, comparator, threshold, time_window_secs, \
     count_threshold, repeat_interval_secs, enabled, recipients, last_triggered_at, created_at, updated_at";

// =============================================================================
// Types
// =============================================================================

/// Alert condition record stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertCondition {
    pub id: i64,
    /// Unique human-readable name.
    pub name: String,
    /// Telemetry kind the condition scans.
    pub source: SampleKind,
    /// Metric the comparison applies to (sensor name, `cpu`, `used_pct`, ...).
    pub field_name: String,
    pub comparator: Comparator,
    /// Threshold as entered; parsed as a number for numeric comparators.
    pub threshold: String,
    /// Look-back window; the evaluator default applies when unset.
    #[serde(with = "humantime_serde")]
    pub time_window: Option<Duration>,
    /// Matching samples per host required to trigger (1 when unset).
    pub count_threshold: Option<u32>,
    /// Minimum time between two triggers of this condition.
    #[serde(with = "humantime_serde")]
    pub repeat_interval: Option<Duration>,
    pub enabled: bool,
    /// Notification recipients.
    pub recipients: Vec<String>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Definition of a condition to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCondition {
    pub name: String,
    pub source: SampleKind,
    #[serde(alias = "target_metric")]
    pub field_name: String,
    pub comparator: Comparator,
    #[serde(deserialize_with = "deserialize_threshold")]
    pub threshold: String,
    #[serde(default, with = "humantime_serde")]
    pub time_window: Option<Duration>,
    #[serde(default)]
    pub count_threshold: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub repeat_interval: Option<Duration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// Accept thresholds written either as numbers or strings.
pub(crate) fn deserialize_threshold<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

impl NewCondition {
    /// Check the definition is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("condition name must not be empty".to_string());
        }
        if self.field_name.trim().is_empty() {
            return Err(format!("condition '{}': field_name must not be empty", self.name));
        }
        if self.comparator.is_numeric() && self.threshold.trim().parse::<f64>().is_err() {
            return Err(format!(
                "condition '{}': threshold '{}' is not a number but comparator '{}' is numeric",
                self.name, self.threshold, self.comparator
            ));
        }
        if self.count_threshold == Some(0) {
            return Err(format!(
                "condition '{}': count_threshold must be at least 1",
                self.name
            ));
        }
        if self.time_window.is_some_and(|w| w.is_zero()) {
            return Err(format!("condition '{}': time_window must be positive", self.name));
        }
        Ok(())
    }
}

/// Sync result for config-file conditions.
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Number of conditions added.
    pub added: usize,
    /// Number of conditions already present (left untouched).
    pub skipped: usize,
}

// =============================================================================
// Condition Store
// =============================================================================

/// Alert condition storage facade.
#[derive(Clone)]
pub struct ConditionStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for ConditionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionStore").finish_non_exhaustive()
    }
}

impl ConditionStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new condition.
    ///
    /// Fails with [`StorageError::Conflict`] if the name is taken.
    pub async fn insert(&self, condition: &NewCondition) -> Result<AlertCondition, StorageError> {
        let now = to_micros(Utc::now());
        let sql = format!(
            "INSERT INTO alert_conditions
                 (name, source, field_name, comparator, threshold, time_window_secs, count_threshold,
                  repeat_interval_secs, enabled, recipients, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {CONDITION_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&condition.name)
            .bind(condition.source.as_ref())
            .bind(&condition.field_name)
            .bind(condition.comparator.as_ref())
            .bind(condition.threshold.trim())
            .bind(condition.time_window.map(duration_secs))
            .bind(condition.count_threshold.map(i64::from))
            .bind(condition.repeat_interval.map(duration_secs))
            .bind(condition.enabled)
            .bind(serde_json::to_string(&condition.recipients)?)
            .bind(now)
            .bind(now)
            .fetch_one(self.pool.inner())
            .await
            .map_err(|e| {
                let err = StorageError::from(e);
                if err.is_unique_violation() {
                    StorageError::Conflict(format!("condition '{}' already exists", condition.name))
                } else {
                    err
                }
            })?;

        row_to_condition(&row)
    }

    /// Get a condition by ID.
    pub async fn get(&self, id: i64) -> Result<Option<AlertCondition>, StorageError> {
        let sql = format!("SELECT {CONDITION_COLUMNS} FROM alert_conditions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;
        row.as_ref().map(row_to_condition).transpose()
    }

    /// Get a condition by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<AlertCondition>, StorageError> {
        let sql = format!("SELECT {CONDITION_COLUMNS} FROM alert_conditions WHERE name = ?");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(self.pool.inner())
            .await?;
        row.as_ref().map(row_to_condition).transpose()
    }

    /// List conditions ordered by ID.
    pub async fn list(&self, enabled_only: bool) -> Result<Vec<AlertCondition>, StorageError> {
        let sql = if enabled_only {
            format!("SELECT {CONDITION_COLUMNS} FROM alert_conditions WHERE enabled = 1 ORDER BY id")
        } else {
            format!("SELECT {CONDITION_COLUMNS} FROM alert_conditions ORDER BY id")
        };
        let rows = sqlx::query(&sql).fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_condition).collect()
    }

    /// Enable or disable a condition.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<AlertCondition, StorageError> {
        let sql = format!(
            "UPDATE alert_conditions SET enabled = ?, updated_at = ? WHERE id = ?
             RETURNING {CONDITION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(enabled)
            .bind(to_micros(Utc::now()))
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("alert condition {id}")))?;
        row_to_condition(&row)
    }

    /// Record the instant the condition last produced a new alert event.
    pub async fn mark_triggered(&self, id: i64, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query("UPDATE alert_conditions SET last_triggered_at = ? WHERE id = ?")
            .bind(to_micros(at))
            .bind(id)
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }

    /// Sync config-file conditions.
    ///
    /// Conditions are matched by name. Missing ones are inserted; existing ones
    /// are left untouched so changes made through the API survive restarts.
    pub async fn sync_from_config(
        &self,
        conditions: &[NewCondition],
    ) -> Result<SyncResult, StorageError> {
        let mut result = SyncResult::default();

        for condition in conditions {
            let now = to_micros(Utc::now());
            let inserted = sqlx::query(
                "INSERT INTO alert_conditions
                     (name, source, field_name, comparator, threshold, time_window_secs, count_threshold,
                      repeat_interval_secs, enabled, recipients, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&condition.name)
            .bind(condition.source.as_ref())
            .bind(&condition.field_name)
            .bind(condition.comparator.as_ref())
            .bind(condition.threshold.trim())
            .bind(condition.time_window.map(duration_secs))
            .bind(condition.count_threshold.map(i64::from))
            .bind(condition.repeat_interval.map(duration_secs))
            .bind(condition.enabled)
            .bind(serde_json::to_string(&condition.recipients)?)
            .bind(now)
            .bind(now)
            .execute(self.pool.inner())
            .await?
            .rows_affected()
                > 0;

            if inserted {
                result.added += 1;
            } else {
                result.skipped += 1;
            }
        }

        Ok(result)
    }
}

fn duration_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

fn secs_duration(secs: Option<i64>) -> Option<Duration> {
    secs.map(|s| Duration::from_secs(s.max(0).unsigned_abs()))
}

fn row_to_condition(row: &SqliteRow) -> Result<AlertCondition, StorageError> {
    let source: String = row.try_get("source")?;
    let comparator: String = row.try_get("comparator")?;
    let recipients: String = row.try_get("recipients")?;
    let count_threshold: Option<i64> = row.try_get("count_threshold")?;

    Ok(AlertCondition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source: SampleKind::from_str(&source)
            .map_err(|_| StorageError::InvalidData(format!("unknown sample kind '{source}'")))?,
        field_name: row.try_get("field_name")?,
        comparator: Comparator::from_str(&comparator)
            .map_err(|_| StorageError::InvalidData(format!("unknown comparator '{comparator}'")))?,
        threshold: row.try_get("threshold")?,
        time_window: secs_duration(row.try_get("time_window_secs")?),
        count_threshold: count_threshold.map(|c| u32::try_from(c).unwrap_or(u32::MAX)),
        repeat_interval: secs_duration(row.try_get("repeat_interval_secs")?),
        enabled: row.try_get("enabled")?,
        recipients: serde_json::from_str(&recipients)?,
        last_triggered_at: row
            .try_get::<Option<i64>, _>("last_triggered_at")?
            .map(from_micros),
        created_at: from_micros(row.try_get("created_at")?),
        updated_at: from_micros(row.try_get("updated_at")?),
    })
}
