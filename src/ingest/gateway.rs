//! Ingestion gateway: validated payloads into the telemetry store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::ingest::IngestError;
use crate::ingest::payload::{TelemetryBatch, validate_discovery};
use crate::storage::{
    Device, DeviceDiscovery, DeviceStore, HostSample, InsertOutcome, SampleStore, StorageError,
};

/// Behaviour of a discovery heartbeat for an IP that is already known.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceRefreshPolicy {
    /// Leave the stored record untouched.
    #[default]
    KeepExisting,
    /// Refresh name, MAC, vendor and last-seen, and mark the device online.
    RefreshMetadata,
}

/// Per-collection result of a telemetry push.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<InsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensors: Option<InsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<InsertOutcome>,
}

impl IngestReport {
    /// Total rows written across collections.
    pub fn inserted(&self) -> u64 {
        [self.processes, self.sensors, self.disks]
            .iter()
            .flatten()
            .map(|o| o.inserted)
            .sum()
    }
}

/// Result of a device discovery heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceUpsert {
    /// Whether the device was new.
    pub created: bool,
    pub device: Device,
}

/// Idempotent writer for agent pushes.
///
/// The gateway never evaluates alerts nor broadcasts.
#[derive(Debug, Clone)]
pub struct IngestGateway {
    samples: SampleStore,
    devices: DeviceStore,
    device_refresh: DeviceRefreshPolicy,
    max_batch: usize,
}

impl IngestGateway {
    pub fn new(
        samples: SampleStore,
        devices: DeviceStore,
        device_refresh: DeviceRefreshPolicy,
        max_batch: usize,
    ) -> Self {
        Self {
            samples,
            devices,
            device_refresh,
            max_batch,
        }
    }

    /// Validate and store a telemetry batch.
    ///
    /// Validation covers the whole batch before the first write. Collections
    /// are committed independently: a store failure on a later collection
    /// leaves earlier ones in place.
    pub async fn ingest_telemetry(&self, batch: TelemetryBatch) -> Result<IngestReport, IngestError> {
        let batch = batch.validate(Utc::now(), self.max_batch)?;

        let mut report = IngestReport {
            hostname: batch.hostname.clone(),
            ..Default::default()
        };
        report.processes = self.write_collection("processes", batch.processes).await?;
        report.sensors = self.write_collection("sensors", batch.sensors).await?;
        report.disks = self.write_collection("disks", batch.disks).await?;

        tracing::debug!(
            hostname = %report.hostname,
            inserted = report.inserted(),
            "Telemetry batch stored"
        );
        Ok(report)
    }

    async fn write_collection(
        &self,
        collection: &'static str,
        samples: Option<Vec<HostSample>>,
    ) -> Result<Option<InsertOutcome>, StorageError> {
        let Some(samples) = samples else {
            return Ok(None);
        };
        let outcome = self.samples.insert_batch(&samples).await.inspect_err(|e| {
            tracing::error!(collection, error = %e, "Failed to store telemetry collection");
        })?;
        if outcome.duplicates > 0 {
            tracing::debug!(collection, duplicates = outcome.duplicates, "Skipped duplicate samples");
        }
        Ok(Some(outcome))
    }

    /// Upsert a device keyed by IP address according to the refresh policy.
    pub async fn register_device(
        &self,
        discovery: DeviceDiscovery,
    ) -> Result<DeviceUpsert, IngestError> {
        let discovery = validate_discovery(discovery)?;
        let now = Utc::now();

        let created = match self.device_refresh {
            DeviceRefreshPolicy::KeepExisting => {
                self.devices.insert_if_absent(&discovery, now).await?
            }
            DeviceRefreshPolicy::RefreshMetadata => self.devices.refresh(&discovery, now).await?,
        };

        let device = self
            .devices
            .get_by_ip(&discovery.ip)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("device {}", discovery.ip)))?;

        if created {
            tracing::info!(ip = %device.ip_address, name = ?device.name, "New device discovered");
        }
        Ok(DeviceUpsert { created, device })
    }

    /// List known devices.
    pub async fn devices(&self) -> Result<Vec<Device>, StorageError> {
        self.devices.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SampleKind, SampleQuery, StorageBuilder, StorageHandles};

    async fn gateway(policy: DeviceRefreshPolicy) -> (IngestGateway, StorageHandles) {
        let handles = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
        let gateway = IngestGateway::new(
            handles.samples.clone(),
            handles.devices.clone(),
            policy,
            1_000,
        );
        (gateway, handles)
    }

    fn batch(json: serde_json::Value) -> TelemetryBatch {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn test_sensors_only_batch_leaves_other_kinds_alone() {
        let (gateway, handles) = gateway(DeviceRefreshPolicy::default()).await;

        let report = gateway
            .ingest_telemetry(batch(serde_json::json!({
                "hostname": "h1",
                "sensors": [{"name": "cpu_temp", "value": 95.0}]
            })))
            .await
            .unwrap();

        assert_eq!(report.sensors.unwrap().inserted, 1);
        assert!(report.processes.is_none());
        assert!(report.disks.is_none());
        assert_eq!(handles.samples.count(Some(SampleKind::Sensor)).await.unwrap(), 1);
        assert_eq!(handles.samples.count(Some(SampleKind::Process)).await.unwrap(), 0);
        assert_eq!(handles.samples.count(Some(SampleKind::Disk)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_idempotent() {
        let (gateway, handles) = gateway(DeviceRefreshPolicy::default()).await;
        let payload = serde_json::json!({
            "hostname": "h1",
            "timestamp": "2024-05-01T10:00:00Z",
            "processes": [{"pid": 1, "name": "init"}],
            "disks": [{"name": "/", "totalGB": 10.0, "usedGB": 5.0}]
        });

        let first = gateway.ingest_telemetry(batch(payload.clone())).await.unwrap();
        assert_eq!(first.inserted(), 2);

        let second = gateway.ingest_telemetry(batch(payload)).await.unwrap();
        assert_eq!(second.inserted(), 0);
        assert_eq!(second.processes.unwrap().duplicates, 1);
        assert_eq!(handles.samples.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_same_named_sensors_in_one_batch_are_all_kept() {
        let (gateway, handles) = gateway(DeviceRefreshPolicy::default()).await;
        let payload = serde_json::json!({
            "hostname": "h1",
            "timestamp": "2024-05-01T10:00:00Z",
            "sensors": [
                {"name": "temp1", "value": 40.0},
                {"name": "temp1", "value": 95.0}
            ]
        });

        let first = gateway.ingest_telemetry(batch(payload.clone())).await.unwrap();
        let sensors = first.sensors.unwrap();
        assert_eq!(sensors.inserted, 2);
        assert_eq!(sensors.duplicates, 0);

        let stored = handles
            .samples
            .query(SampleQuery {
                kind: Some(SampleKind::Sensor),
                metric: Some("temp1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut values: Vec<_> = stored
            .iter()
            .filter_map(|s| s.payload.primary_value())
            .collect();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![40.0, 95.0]);

        // Re-delivery of the same batch still dedups element for element
        let second = gateway.ingest_telemetry(batch(payload)).await.unwrap();
        assert_eq!(second.sensors.unwrap().duplicates, 2);
        assert_eq!(handles.samples.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_batch_writes_nothing() {
        let (gateway, handles) = gateway(DeviceRefreshPolicy::default()).await;

        let err = gateway
            .ingest_telemetry(batch(serde_json::json!({
                "hostname": "h1",
                "processes": [{"pid": 1, "name": "init"}],
                "disks": [{"name": "/", "totalGB": -1.0, "usedGB": 5.0}]
            })))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(handles.samples.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_device_keep_existing() {
        let (gateway, _handles) = gateway(DeviceRefreshPolicy::KeepExisting).await;
        let discovery = |name: &str| DeviceDiscovery {
            ip: "10.0.0.9".to_string(),
            mac: None,
            name: Some(name.to_string()),
            vendor: None,
        };

        let first = gateway.register_device(discovery("nas")).await.unwrap();
        assert!(first.created);

        let second = gateway.register_device(discovery("renamed")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.device.name.as_deref(), Some("nas"));
        assert_eq!(second.device.id, first.device.id);
        assert_eq!(gateway.devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_device_refresh_metadata() {
        let (gateway, _handles) = gateway(DeviceRefreshPolicy::RefreshMetadata).await;
        let discovery = |name: &str| DeviceDiscovery {
            ip: "10.0.0.9".to_string(),
            mac: None,
            name: Some(name.to_string()),
            vendor: None,
        };

        gateway.register_device(discovery("nas")).await.unwrap();
        let second = gateway.register_device(discovery("backup-nas")).await.unwrap();
        assert_eq!(second.device.name.as_deref(), Some("backup-nas"));
        assert_eq!(gateway.devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_device_rejects_bad_ip() {
        let (gateway, _handles) = gateway(DeviceRefreshPolicy::default()).await;
        let err = gateway
            .register_device(DeviceDiscovery {
                ip: "nope".to_string(),
                mac: None,
                name: None,
                vendor: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[test]
    fn test_policy_parse() {
        use std::str::FromStr;
        assert_eq!(
            DeviceRefreshPolicy::from_str("refresh_metadata").unwrap(),
            DeviceRefreshPolicy::RefreshMetadata
        );
        assert_eq!(DeviceRefreshPolicy::default().as_ref(), "keep_existing");
    }
}
