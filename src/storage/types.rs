//! Core data types for the storage layer.
//!
//! This module defines the primary data structures used throughout the storage layer:
//!
//! - [`HostSample`]: Immutable telemetry fact pushed by an agent, tagged by [`SamplePayload`]
//! - [`Device`]: Discovered network device keyed by IP address
//! - [`Comparator`]: Comparison operator of an alert condition
//! - [`Event`]: Activity log records (audit trail, system lifecycle, errors)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Convert a timestamp to the integer representation stored in SQLite.
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Convert a stored integer timestamp back to UTC.
pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

// =============================================================================
// Telemetry
// =============================================================================

/// Telemetry sample kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SampleKind {
    /// Running process snapshot.
    Process,
    /// Hardware sensor reading.
    Sensor,
    /// Disk usage snapshot.
    Disk,
}

/// Physical quantity of a sensor reading, derived from the sensor name.
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
pub enum SensorValueType {
    Temperature,
    Voltage,
    Rpm,
    Percentage,
    Power,
    Frequency,
    Current,
    DataRate,
    MemorySize,
    #[default]
    Unknown,
}

/// A single process entry reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    #[serde(default)]
    pub pid: Option<u32>,
    pub name: String,
    /// CPU time or usage as reported by the agent.
    #[serde(default, alias = "cpuTime")]
    pub cpu: Option<f64>,
    /// Resident memory in megabytes.
    #[serde(default, alias = "memoryMB")]
    pub mem: Option<f64>,
    #[serde(default)]
    pub command: Option<String>,
}

/// A single sensor reading reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default, alias = "valueType")]
    pub value_type: SensorValueType,
}

/// A single disk usage entry reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSample {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(alias = "totalGB")]
    pub total_gb: f64,
    #[serde(alias = "usedGB")]
    pub used_gb: f64,
    #[serde(default, alias = "freeGB")]
    pub free_gb: Option<f64>,
}

impl DiskSample {
    /// Free space, derived from total and used when the agent omitted it.
    pub fn free(&self) -> f64 {
        self.free_gb
            .unwrap_or_else(|| (self.total_gb - self.used_gb).max(0.0))
    }

    /// Used space as a percentage of total (0 when total is unknown).
    pub fn used_pct(&self) -> f64 {
        if self.total_gb > 0.0 {
            self.used_gb / self.total_gb * 100.0
        } else {
            0.0
        }
    }
}

/// Accepted sample shapes, one variant per [`SampleKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplePayload {
    Process(ProcessSample),
    Sensor(SensorSample),
    Disk(DiskSample),
}

impl SamplePayload {
    pub fn kind(&self) -> SampleKind {
        match self {
            Self::Process(_) => SampleKind::Process,
            Self::Sensor(_) => SampleKind::Sensor,
            Self::Disk(_) => SampleKind::Disk,
        }
    }

    /// Name used for metric filtering (sensor name, process name, disk name).
    pub fn metric(&self) -> &str {
        match self {
            Self::Process(p) => &p.name,
            Self::Sensor(s) => &s.name,
            Self::Disk(d) => &d.name,
        }
    }

    /// Identity of the reporting entity within a host and kind.
    ///
    /// Processes are disambiguated by PID since several may share a name.
    pub fn entity(&self) -> String {
        match self {
            Self::Process(p) => match p.pid {
                Some(pid) => format!("{pid}:{}", p.name),
                None => p.name.clone(),
            },
            Self::Sensor(s) => s.name.clone(),
            Self::Disk(d) => d.name.clone(),
        }
    }

    /// Primary numeric value, stored alongside the payload for cheap scans.
    pub fn primary_value(&self) -> Option<f64> {
        match self {
            Self::Process(p) => p.cpu,
            Self::Sensor(s) => Some(s.value),
            Self::Disk(d) => Some(d.used_pct()),
        }
    }
}

/// A telemetry fact stored in the `host_samples` table.
///
/// Samples are immutable once written. Identity is
/// `(hostname, kind, entity, captured_at)`, with repeated entities of one batch
/// numbered by occurrence; re-delivery is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    /// Auto-generated identifier (None before insert).
    pub id: Option<i64>,
    pub hostname: String,
    /// Capture time reported by the agent.
    pub captured_at: DateTime<Utc>,
    pub payload: SamplePayload,
}

impl HostSample {
    pub fn new(
        hostname: impl Into<String>,
        captured_at: DateTime<Utc>,
        payload: SamplePayload,
    ) -> Self {
        Self {
            id: None,
            hostname: hostname.into(),
            captured_at,
            payload,
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.payload.kind()
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Reachability status of a device.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
}

/// A device record stored in the `devices` table, unique by IP address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub status: DeviceStatus,
    pub notes: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Device facts announced by a discovery heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDiscovery {
    pub ip: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
}

// =============================================================================
// Alerting
// =============================================================================

/// Comparison operator of an alert condition.
///
/// Numeric operators compare against a parsed threshold; text operators are
/// case-insensitive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
pub enum Comparator {
    #[serde(rename = ">")]
    #[strum(serialize = ">")]
    Gt,
    #[serde(rename = ">=")]
    #[strum(serialize = ">=")]
    Ge,
    #[serde(rename = "<")]
    #[strum(serialize = "<")]
    Lt,
    #[serde(rename = "<=")]
    #[strum(serialize = "<=")]
    Le,
    #[serde(rename = "==")]
    #[strum(serialize = "==")]
    Eq,
    #[serde(rename = "!=")]
    #[strum(serialize = "!=")]
    Ne,
    #[serde(rename = "contains")]
    #[strum(serialize = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    #[strum(serialize = "not_contains")]
    NotContains,
    #[serde(rename = "equals")]
    #[strum(serialize = "equals")]
    Equals,
}

impl Comparator {
    /// Whether this comparator requires a numeric threshold.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Gt | Self::Ge | Self::Lt | Self::Le | Self::Eq | Self::Ne
        )
    }
}

// =============================================================================
// Activity log
// =============================================================================

/// Free-form key/value context attached to an event.
pub type EventPayload = BTreeMap<String, serde_json::Value>;

/// An event record stored in the `events` table.
///
/// Events form the activity log: audit entries for resolutions and catalog
/// changes, lifecycle notices, and errors raised by background jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Auto-generated event identifier.
    pub id: Option<i64>,
    /// Event timestamp (UTC).
    pub ts: DateTime<Utc>,
    /// Event origin (e.g., "alert.resolution", "system").
    pub source: String,
    /// Event nature/handling class.
    pub kind: EventKind,
    /// Delivery priority/urgency.
    pub severity: EventSeverity,
    /// Short human-readable description.
    pub message: String,
    /// Context snapshot.
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        source: impl Into<String>,
        kind: EventKind,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            ts: Utc::now(),
            source: source.into(),
            kind,
            severity,
            message: message.into(),
            payload: EventPayload::new(),
        }
    }

    /// Attach a payload entry.
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Event kind classification.
///
/// Categorizes events by their nature and intended handling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventKind {
    /// Alert lifecycle notice.
    Alert,
    /// Background job or system error requiring attention.
    Error,
    /// Internal system event (e.g., startup, shutdown).
    System,
    /// Audit trail entry recording who did what.
    Audit,
}

/// Event severity classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_sample_kind_from_str() {
        assert_eq!(SampleKind::from_str("sensor").unwrap(), SampleKind::Sensor);
        assert_eq!(SampleKind::from_str("PROCESS").unwrap(), SampleKind::Process);
        assert!(SampleKind::from_str("device").is_err());
    }

    #[test]
    fn test_comparator_symbols() {
        assert_eq!(Comparator::from_str(">").unwrap(), Comparator::Gt);
        assert_eq!(Comparator::from_str(">=").unwrap(), Comparator::Ge);
        assert_eq!(Comparator::from_str("not_contains").unwrap(), Comparator::NotContains);
        assert_eq!(Comparator::Ne.as_ref(), "!=");
        assert!(Comparator::from_str("~=").is_err());

        let parsed: Comparator = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(parsed, Comparator::Le);
        assert!(parsed.is_numeric());
        assert!(!Comparator::Contains.is_numeric());
    }

    #[test]
    fn test_payload_tagging() {
        let payload = SamplePayload::Sensor(SensorSample {
            name: "cpu_temp".to_string(),
            value: 95.0,
            min: None,
            max: None,
            value_type: SensorValueType::Temperature,
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "sensor");
        assert_eq!(json["value_type"], "temperature");
        assert_eq!(payload.kind(), SampleKind::Sensor);
        assert_eq!(payload.metric(), "cpu_temp");
        assert_eq!(payload.primary_value(), Some(95.0));
    }

    #[test]
    fn test_process_entity_uses_pid() {
        let with_pid = SamplePayload::Process(ProcessSample {
            pid: Some(42),
            name: "nginx".to_string(),
            cpu: None,
            mem: None,
            command: None,
        });
        assert_eq!(with_pid.entity(), "42:nginx");

        let without_pid = SamplePayload::Process(ProcessSample {
            pid: None,
            name: "nginx".to_string(),
            cpu: None,
            mem: None,
            command: None,
        });
        assert_eq!(without_pid.entity(), "nginx");
    }

    #[test]
    fn test_disk_derived_values() {
        let disk = DiskSample {
            name: "C:".to_string(),
            label: None,
            total_gb: 200.0,
            used_gb: 150.0,
            free_gb: None,
        };
        assert_eq!(disk.free(), 50.0);
        assert_eq!(disk.used_pct(), 75.0);
    }

    #[test]
    fn test_event_kind_and_severity_strings() {
        assert_eq!(EventKind::from_str("AUDIT").unwrap(), EventKind::Audit);
        assert_eq!(EventKind::Alert.as_ref(), "alert");
        assert_eq!(EventSeverity::from_str("Warn").unwrap(), EventSeverity::Warn);
        assert!(EventSeverity::from_str("fatal").is_err());
    }

    #[test]
    fn test_event_with_payload() {
        let event = Event::new("system", EventKind::System, EventSeverity::Info, "Started")
            .with_payload("version", "1.0.0");
        assert_eq!(event.payload.get("version"), Some(&serde_json::json!("1.0.0")));
    }

    #[test]
    fn test_micros_roundtrip() {
        let now = Utc::now();
        let back = from_micros(to_micros(now));
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }
}
