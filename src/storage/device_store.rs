//! Device storage.
//!
//! Devices are keyed by IP address and never duplicated. Repeated discovery
//! heartbeats either leave the row untouched or refresh its metadata.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{Device, DeviceDiscovery, DeviceStatus, from_micros, to_micros};

const DEVICE_COLUMNS: &str = "id, ip_address, mac_address, name, vendor, status, notes, first_seen_at, last_seen_at";

/// Device storage facade.
#[derive(Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStore").finish_non_exhaustive()
    }
}

impl DeviceStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the device as online unless its IP is already known.
    ///
    /// Returns `true` when a new row was created.
    pub async fn insert_if_absent(
        &self,
        discovery: &DeviceDiscovery,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let now = to_micros(now);
        let result = sqlx::query(
            "INSERT INTO devices (ip_address, mac_address, name, vendor, status, first_seen_at, last_seen_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (ip_address) DO NOTHING",
        )
        .bind(&discovery.ip)
        .bind(&discovery.mac)
        .bind(&discovery.name)
        .bind(&discovery.vendor)
        .bind(DeviceStatus::Online.as_ref())
        .bind(now)
        .bind(now)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert the device, or refresh name/mac/vendor/last-seen and mark it
    /// online if the IP is already known. Absent fields keep their stored value.
    ///
    /// Returns `true` when a new row was created.
    pub async fn refresh(
        &self,
        discovery: &DeviceDiscovery,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let now = to_micros(now);
        let first_seen_at: i64 = sqlx::query_scalar(
            "INSERT INTO devices (ip_address, mac_address, name, vendor, status, first_seen_at, last_seen_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (ip_address) DO UPDATE SET
                 mac_address  = COALESCE(excluded.mac_address, devices.mac_address),
                 name         = COALESCE(excluded.name, devices.name),
                 vendor       = COALESCE(excluded.vendor, devices.vendor),
                 status       = excluded.status,
                 last_seen_at = excluded.last_seen_at
             RETURNING first_seen_at",
        )
        .bind(&discovery.ip)
        .bind(&discovery.mac)
        .bind(&discovery.name)
        .bind(&discovery.vendor)
        .bind(DeviceStatus::Online.as_ref())
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.inner())
        .await?;

        Ok(first_seen_at == now)
    }

    /// Get a device by IP address.
    pub async fn get_by_ip(&self, ip: &str) -> Result<Option<Device>, StorageError> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE ip_address = ?");
        let row = sqlx::query(&sql)
            .bind(ip)
            .fetch_optional(self.pool.inner())
            .await?;
        row.as_ref().map(row_to_device).transpose()
    }

    /// List all devices ordered by IP address.
    pub async fn list(&self) -> Result<Vec<Device>, StorageError> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY ip_address");
        let rows = sqlx::query(&sql).fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_device).collect()
    }
}

fn row_to_device(row: &SqliteRow) -> Result<Device, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(Device {
        id: row.try_get("id")?,
        ip_address: row.try_get("ip_address")?,
        mac_address: row.try_get("mac_address")?,
        name: row.try_get("name")?,
        vendor: row.try_get("vendor")?,
        status: DeviceStatus::from_str(&status)
            .map_err(|_| StorageError::InvalidData(format!("unknown device status '{status}'")))?,
        notes: row.try_get("notes")?,
        first_seen_at: from_micros(row.try_get("first_seen_at")?),
        last_seen_at: from_micros(row.try_get("last_seen_at")?),
    })
}
