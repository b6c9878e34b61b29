//! Field extraction and comparison for alert conditions.

use crate::storage::{Comparator, SampleKind, SamplePayload};

/// Threshold parsed according to its comparator.
#[derive(Debug, Clone, PartialEq)]
pub enum Threshold {
    Number(f64),
    /// Lowercased for case-insensitive matching.
    Text(String),
}

impl Threshold {
    /// Parse a raw threshold.
    ///
    /// Numeric comparators require a finite number.
    pub fn parse(comparator: Comparator, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if comparator.is_numeric() {
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Self::Number)
                .ok_or_else(|| format!("threshold '{raw}' is not a number"))
        } else {
            Ok(Self::Text(raw.to_lowercase()))
        }
    }
}

/// Which part of a sample a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Sensor reading; the condition's field name selects the sensor.
    SensorValue,
    ProcessCpu,
    ProcessMem,
    ProcessPid,
    ProcessName,
    ProcessCommand,
    DiskUsedPct,
    DiskUsedGb,
    DiskFreeGb,
    DiskTotalGb,
    DiskName,
    DiskLabel,
}

impl Field {
    /// Resolve the field a condition on `kind` refers to.
    pub fn resolve(kind: SampleKind, field_name: &str) -> Result<Self, String> {
        let field = match kind {
            SampleKind::Sensor => return Ok(Self::SensorValue),
            SampleKind::Process => match field_name {
                "cpu" => Self::ProcessCpu,
                "mem" => Self::ProcessMem,
                "pid" => Self::ProcessPid,
                "name" => Self::ProcessName,
                "command" => Self::ProcessCommand,
                _ => return Err(format!("unknown process field '{field_name}'")),
            },
            SampleKind::Disk => match field_name {
                "used_pct" => Self::DiskUsedPct,
                "used_gb" => Self::DiskUsedGb,
                "free_gb" => Self::DiskFreeGb,
                "total_gb" => Self::DiskTotalGb,
                "name" => Self::DiskName,
                "label" => Self::DiskLabel,
                _ => return Err(format!("unknown disk field '{field_name}'")),
            },
        };
        Ok(field)
    }
}

/// Value read from a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Number(f64),
    Text(&'a str),
    Missing,
}

/// Read `field` from a sample payload. A payload of another kind reads as missing.
pub fn extract(field: Field, payload: &SamplePayload) -> FieldValue<'_> {
    match (field, payload) {
        (Field::SensorValue, SamplePayload::Sensor(s)) => FieldValue::Number(s.value),
        (Field::ProcessCpu, SamplePayload::Process(p)) => number(p.cpu),
        (Field::ProcessMem, SamplePayload::Process(p)) => number(p.mem),
        (Field::ProcessPid, SamplePayload::Process(p)) => number(p.pid.map(f64::from)),
        (Field::ProcessName, SamplePayload::Process(p)) => FieldValue::Text(&p.name),
        (Field::ProcessCommand, SamplePayload::Process(p)) => text(p.command.as_deref()),
        (Field::DiskUsedPct, SamplePayload::Disk(d)) => FieldValue::Number(d.used_pct()),
        (Field::DiskUsedGb, SamplePayload::Disk(d)) => FieldValue::Number(d.used_gb),
        (Field::DiskFreeGb, SamplePayload::Disk(d)) => FieldValue::Number(d.free()),
        (Field::DiskTotalGb, SamplePayload::Disk(d)) => FieldValue::Number(d.total_gb),
        (Field::DiskName, SamplePayload::Disk(d)) => FieldValue::Text(&d.name),
        (Field::DiskLabel, SamplePayload::Disk(d)) => text(d.label.as_deref()),
        _ => FieldValue::Missing,
    }
}

fn number(v: Option<f64>) -> FieldValue<'static> {
    v.map_or(FieldValue::Missing, FieldValue::Number)
}

fn text(v: Option<&str>) -> FieldValue<'_> {
    v.map_or(FieldValue::Missing, FieldValue::Text)
}

/// Whether `value` satisfies `comparator` against `threshold`.
///
/// Missing values never match. Text comparators are case-insensitive and
/// apply to numbers through their decimal representation.
pub fn matches(comparator: Comparator, value: &FieldValue<'_>, threshold: &Threshold) -> bool {
    match (value, threshold) {
        (FieldValue::Missing, _) => false,
        (FieldValue::Number(v), Threshold::Number(t)) => match comparator {
            Comparator::Gt => v > t,
            Comparator::Ge => v >= t,
            Comparator::Lt => v < t,
            Comparator::Le => v <= t,
            Comparator::Eq => v == t,
            Comparator::Ne => v != t,
            Comparator::Contains | Comparator::NotContains | Comparator::Equals => false,
        },
        (FieldValue::Text(_), Threshold::Number(_)) => false,
        (value, Threshold::Text(t)) => {
            let v = match value {
                FieldValue::Number(n) => n.to_string(),
                FieldValue::Text(s) => s.to_lowercase(),
                FieldValue::Missing => return false,
            };
            match comparator {
                Comparator::Contains => v.contains(t.as_str()),
                Comparator::NotContains => !v.contains(t.as_str()),
                Comparator::Equals => v == *t,
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskSample, ProcessSample, SensorSample, SensorValueType};

    fn sensor(value: f64) -> SamplePayload {
        SamplePayload::Sensor(SensorSample {
            name: "cpu_temp".to_string(),
            value,
            min: None,
            max: None,
            value_type: SensorValueType::Temperature,
        })
    }

    fn process(name: &str, cpu: Option<f64>, command: Option<&str>) -> SamplePayload {
        SamplePayload::Process(ProcessSample {
            pid: Some(7),
            name: name.to_string(),
            cpu,
            mem: None,
            command: command.map(str::to_string),
        })
    }

    fn check(comparator: Comparator, raw: &str, payload: &SamplePayload, field: Field) -> bool {
        let threshold = Threshold::parse(comparator, raw).unwrap();
        matches(comparator, &extract(field, payload), &threshold)
    }

    #[test]
    fn test_numeric_comparators() {
        let hot = sensor(95.0);
        assert!(check(Comparator::Gt, "90", &hot, Field::SensorValue));
        assert!(!check(Comparator::Gt, "95", &hot, Field::SensorValue));
        assert!(check(Comparator::Ge, "95", &hot, Field::SensorValue));
        assert!(check(Comparator::Lt, "100", &hot, Field::SensorValue));
        assert!(check(Comparator::Le, "95.0", &hot, Field::SensorValue));
        assert!(check(Comparator::Eq, "95", &hot, Field::SensorValue));
        assert!(check(Comparator::Ne, "90", &hot, Field::SensorValue));
    }

    #[test]
    fn test_text_comparators_are_case_insensitive() {
        let miner = process("XMRig", None, Some("/tmp/XMRIG --donate 0"));
        assert!(check(Comparator::Contains, "xmr", &miner, Field::ProcessName));
        assert!(check(Comparator::Equals, "xmrig", &miner, Field::ProcessName));
        assert!(check(Comparator::NotContains, "nginx", &miner, Field::ProcessName));
        assert!(check(Comparator::Contains, "--DONATE", &miner, Field::ProcessCommand));
    }

    #[test]
    fn test_missing_values_never_match() {
        let idle = process("sleep", None, None);
        assert!(!check(Comparator::Gt, "0", &idle, Field::ProcessCpu));
        assert!(!check(Comparator::NotContains, "x", &idle, Field::ProcessCommand));
        // Field of another kind
        assert!(!check(Comparator::Gt, "0", &sensor(1.0), Field::DiskUsedPct));
    }

    #[test]
    fn test_disk_fields() {
        let disk = SamplePayload::Disk(DiskSample {
            name: "/".to_string(),
            label: Some("root".to_string()),
            total_gb: 100.0,
            used_gb: 92.0,
            free_gb: None,
        });
        assert!(check(Comparator::Ge, "90", &disk, Field::DiskUsedPct));
        assert!(check(Comparator::Lt, "10", &disk, Field::DiskFreeGb));
        assert!(check(Comparator::Equals, "ROOT", &disk, Field::DiskLabel));
    }

    #[test]
    fn test_threshold_parse() {
        assert_eq!(
            Threshold::parse(Comparator::Gt, " 90.5 ").unwrap(),
            Threshold::Number(90.5)
        );
        assert!(Threshold::parse(Comparator::Gt, "hot").is_err());
        assert!(Threshold::parse(Comparator::Lt, "NaN").is_err());
        assert_eq!(
            Threshold::parse(Comparator::Contains, "Fail").unwrap(),
            Threshold::Text("fail".to_string())
        );
    }

    #[test]
    fn test_field_resolve() {
        assert_eq!(
            Field::resolve(SampleKind::Sensor, "anything").unwrap(),
            Field::SensorValue
        );
        assert_eq!(
            Field::resolve(SampleKind::Process, "cpu").unwrap(),
            Field::ProcessCpu
        );
        assert_eq!(
            Field::resolve(SampleKind::Disk, "used_pct").unwrap(),
            Field::DiskUsedPct
        );
        assert!(Field::resolve(SampleKind::Process, "temperature").is_err());
        assert!(Field::resolve(SampleKind::Disk, "cpu").is_err());
    }
}
