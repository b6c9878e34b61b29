//! Push payloads accepted from agents and their validation.
//!
//! Raw payloads are deserialized leniently (agent field aliases accepted) and
//! then validated into tagged [`HostSample`]s before anything is written.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::IngestError;
use crate::storage::{
    DeviceDiscovery, DiskSample, HostSample, ProcessSample, SamplePayload, SensorSample,
    SensorValueType,
};

/// Telemetry batch pushed by one host.
///
/// Every collection is optional; a sensors-only batch is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryBatch {
    #[serde(default)]
    pub hostname: String,
    /// Capture time (RFC 3339). Defaults to the receive time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processes: Option<Vec<ProcessSample>>,
    #[serde(default)]
    pub sensors: Option<Vec<SensorSample>>,
    #[serde(default)]
    pub disks: Option<Vec<DiskSample>>,
}

/// A batch that passed validation, ready to be written.
#[derive(Debug, Clone)]
pub struct ValidatedBatch {
    pub hostname: String,
    pub captured_at: DateTime<Utc>,
    pub processes: Option<Vec<HostSample>>,
    pub sensors: Option<Vec<HostSample>>,
    pub disks: Option<Vec<HostSample>>,
}

impl TelemetryBatch {
    /// Validate the batch and convert every element into a [`HostSample`].
    ///
    /// `max_batch` caps the number of elements per collection.
    pub fn validate(
        self,
        received_at: DateTime<Utc>,
        max_batch: usize,
    ) -> Result<ValidatedBatch, IngestError> {
        let hostname = self.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(IngestError::Validation("hostname is required".to_string()));
        }
        let captured_at = self.timestamp.unwrap_or(received_at);

        let processes = self
            .processes
            .map(|items| {
                check_len("processes", items.len(), max_batch)?;
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| {
                        validate_process(&p).map_err(|e| element_error("processes", i, e))?;
                        Ok(HostSample::new(&hostname, captured_at, SamplePayload::Process(p)))
                    })
                    .collect::<Result<Vec<_>, IngestError>>()
            })
            .transpose()?;

        let sensors = self
            .sensors
            .map(|items| {
                check_len("sensors", items.len(), max_batch)?;
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut s)| {
                        validate_sensor(&s).map_err(|e| element_error("sensors", i, e))?;
                        s.value_type = classify_sensor(&s.name);
                        Ok(HostSample::new(&hostname, captured_at, SamplePayload::Sensor(s)))
                    })
                    .collect::<Result<Vec<_>, IngestError>>()
            })
            .transpose()?;

        let disks = self
            .disks
            .map(|items| {
                check_len("disks", items.len(), max_batch)?;
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut d)| {
                        validate_disk(&d).map_err(|e| element_error("disks", i, e))?;
                        d.free_gb = Some(d.free());
                        Ok(HostSample::new(&hostname, captured_at, SamplePayload::Disk(d)))
                    })
                    .collect::<Result<Vec<_>, IngestError>>()
            })
            .transpose()?;

        Ok(ValidatedBatch {
            hostname,
            captured_at,
            processes,
            sensors,
            disks,
        })
    }
}

fn check_len(collection: &str, len: usize, max_batch: usize) -> Result<(), IngestError> {
    if len > max_batch {
        return Err(IngestError::Validation(format!(
            "{collection}: {len} elements exceeds the limit of {max_batch}"
        )));
    }
    Ok(())
}

fn element_error(collection: &str, index: usize, message: String) -> IngestError {
    IngestError::Validation(format!("{collection}[{index}]: {message}"))
}

fn validate_process(p: &ProcessSample) -> Result<(), String> {
    if p.name.trim().is_empty() {
        return Err("name is required".to_string());
    }
    if p.cpu.is_some_and(|v| !v.is_finite()) || p.mem.is_some_and(|v| !v.is_finite()) {
        return Err("cpu and mem must be finite numbers".to_string());
    }
    Ok(())
}

fn validate_sensor(s: &SensorSample) -> Result<(), String> {
    if s.name.trim().is_empty() {
        return Err("name is required".to_string());
    }
    if !s.value.is_finite() {
        return Err("value must be a finite number".to_string());
    }
    Ok(())
}

fn validate_disk(d: &DiskSample) -> Result<(), String> {
    if d.name.trim().is_empty() {
        return Err("name is required".to_string());
    }
    if !d.total_gb.is_finite() || !d.used_gb.is_finite() || d.total_gb < 0.0 || d.used_gb < 0.0 {
        return Err("totalGB and usedGB must be non-negative numbers".to_string());
    }
    Ok(())
}

/// Derive the physical quantity of a sensor from its name.
///
/// Single-letter units ("W", "A") only count as standalone tokens.
pub fn classify_sensor(name: &str) -> SensorValueType {
    let lower = name.to_lowercase();
    let has = |needle: &str| lower.contains(needle);
    let has_any = |needles: &[&str]| contains_any(&lower, needles);
    let has_token = |token: &str| {
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|t| t == token)
    };

    if has_any(&["temperature", "temp", "°c", "tdie", "tctl", "hot spot"][..]) {
        SensorValueType::Temperature
    } else if has_any(&["voltage", "volt", "vcore", "avcc", "v standby", "cmos battery", "vid"][..]) {
        SensorValueType::Voltage
    } else if has("fan") && has("rpm") {
        SensorValueType::Rpm
    } else if has("fan") && has("%") {
        SensorValueType::Percentage
    } else if has_any(&["power", "package", "watt"][..]) || has_token("w") {
        SensorValueType::Power
    } else if has_any(&["mhz", "ghz", "bus speed", "clock"][..]) {
        SensorValueType::Frequency
    } else if has_any(&["amp", "current"][..]) || has_token("a") {
        SensorValueType::Current
    } else if has_any(&["utilization", "load", "usage", "%"][..]) {
        SensorValueType::Percentage
    } else if has_any(&["kb/s", "mb/s", "speed"][..]) {
        SensorValueType::DataRate
    } else if has("memory") && has_any(&["gb", "mb", "kb"][..]) {
        SensorValueType::MemorySize
    } else {
        SensorValueType::Unknown
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Validate and normalise a device discovery heartbeat.
///
/// The IP must parse; a MAC, if given, must be six hex octets and is stored
/// lowercase with `:` separators. Blank optional fields become `None`.
pub fn validate_discovery(discovery: DeviceDiscovery) -> Result<DeviceDiscovery, IngestError> {
    static MAC_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let mac_regex = MAC_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[0-9A-Fa-f]{2}([:-][0-9A-Fa-f]{2}){5}$").expect("failed to compile MAC address regex")
    });

    let ip: IpAddr = discovery
        .ip
        .trim()
        .parse()
        .map_err(|_| IngestError::Validation(format!("invalid IP address '{}'", discovery.ip)))?;

    let blank_to_none = |v: Option<String>| {
        v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };

    let mac = match blank_to_none(discovery.mac) {
        Some(mac) if mac_regex.is_match(&mac) => Some(mac.to_lowercase().replace('-', ":")),
        Some(mac) => {
            return Err(IngestError::Validation(format!(
                "invalid MAC address '{mac}'"
            )));
        }
        None => None,
    };

    Ok(DeviceDiscovery {
        ip: ip.to_string(),
        mac,
        name: blank_to_none(discovery.name),
        vendor: blank_to_none(discovery.vendor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SampleKind;

    fn batch(json: serde_json::Value) -> TelemetryBatch {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_agent_field_aliases() {
        let b = batch(serde_json::json!({
            "hostname": "h1",
            "processes": [{"pid": 1, "name": "init", "cpuTime": 0.5, "memoryMB": 12.0}],
            "disks": [{"name": "C:", "label": "System", "totalGB": 100.0, "usedGB": 30.0, "freeGB": 70.0}]
        }));
        let validated = b.validate(Utc::now(), 100).unwrap();

        let processes = validated.processes.unwrap();
        assert_eq!(processes.len(), 1);
        match &processes[0].payload {
            SamplePayload::Process(p) => {
                assert_eq!(p.cpu, Some(0.5));
                assert_eq!(p.mem, Some(12.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(validated.disks.unwrap()[0].kind(), SampleKind::Disk);
        assert!(validated.sensors.is_none());
    }

    #[test]
    fn test_blank_hostname_rejected() {
        let err = batch(serde_json::json!({"hostname": "  ", "sensors": []}))
            .validate(Utc::now(), 100)
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        let err = batch(serde_json::json!({"sensors": []}))
            .validate(Utc::now(), 100)
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[test]
    fn test_malformed_element_reports_position() {
        let err = batch(serde_json::json!({
            "hostname": "h1",
            "sensors": [{"name": "ok", "value": 1.0}, {"name": "", "value": 2.0}]
        }))
        .validate(Utc::now(), 100)
        .unwrap_err();
        assert!(err.to_string().contains("sensors[1]"));
    }

    #[test]
    fn test_batch_limit() {
        let sensors: Vec<_> = (0..3)
            .map(|i| serde_json::json!({"name": format!("s{i}"), "value": 1.0}))
            .collect();
        let err = batch(serde_json::json!({"hostname": "h1", "sensors": sensors}))
            .validate(Utc::now(), 2)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_timestamp_defaults_to_receive_time() {
        let received = Utc::now();
        let validated = batch(serde_json::json!({"hostname": "h1"}))
            .validate(received, 10)
            .unwrap();
        assert_eq!(validated.captured_at, received);

        let validated = batch(serde_json::json!({
            "hostname": "h1",
            "timestamp": "2024-05-01T10:00:00Z"
        }))
        .validate(received, 10)
        .unwrap();
        assert_eq!(validated.captured_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_sensor_value_type_is_derived() {
        let validated = batch(serde_json::json!({
            "hostname": "h1",
            "sensors": [{"name": "CPU Package Temp", "value": 65.0}]
        }))
        .validate(Utc::now(), 10)
        .unwrap();
        match &validated.sensors.unwrap()[0].payload {
            SamplePayload::Sensor(s) => assert_eq!(s.value_type, SensorValueType::Temperature),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_classify_sensor() {
        assert_eq!(classify_sensor("cpu_temp"), SensorValueType::Temperature);
        assert_eq!(classify_sensor("Tctl/Tdie"), SensorValueType::Temperature);
        assert_eq!(classify_sensor("Vcore"), SensorValueType::Voltage);
        assert_eq!(classify_sensor("CPU Fan RPM"), SensorValueType::Rpm);
        assert_eq!(classify_sensor("Fan 1 %"), SensorValueType::Percentage);
        assert_eq!(classify_sensor("CPU Package"), SensorValueType::Power);
        assert_eq!(classify_sensor("GPU Power (W)"), SensorValueType::Power);
        assert_eq!(classify_sensor("Core Clock"), SensorValueType::Frequency);
        assert_eq!(classify_sensor("12V Current"), SensorValueType::Current);
        assert_eq!(classify_sensor("GPU Load"), SensorValueType::Percentage);
        assert_eq!(classify_sensor("Network Speed"), SensorValueType::DataRate);
        assert_eq!(classify_sensor("Memory Used GB"), SensorValueType::MemorySize);
        assert_eq!(classify_sensor("mystery"), SensorValueType::Unknown);
    }

    #[test]
    fn test_validate_discovery() {
        let ok = validate_discovery(DeviceDiscovery {
            ip: " 192.168.1.10 ".to_string(),
            mac: Some("AA-BB-CC-DD-EE-FF".to_string()),
            name: Some("".to_string()),
            vendor: Some("Acme".to_string()),
        })
        .unwrap();
        assert_eq!(ok.ip, "192.168.1.10");
        assert_eq!(ok.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(ok.name, None);

        let bad_ip = validate_discovery(DeviceDiscovery {
            ip: "999.1.1.1".to_string(),
            mac: None,
            name: None,
            vendor: None,
        });
        assert!(bad_ip.is_err());

        let bad_mac = validate_discovery(DeviceDiscovery {
            ip: "10.0.0.1".to_string(),
            mac: Some("not-a-mac".to_string()),
            name: None,
            vendor: None,
        });
        assert!(bad_mac.is_err());
    }
}
