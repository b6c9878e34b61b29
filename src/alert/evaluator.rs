//! Alert evaluator.
//!
//! Scans recent telemetry against every enabled condition and opens alert
//! events per host. Runs may overlap: the one-open-event-per-key constraint in
//! the alert store turns a second open attempt into a no-op, so no process
//! lock is needed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::alert::EvaluationError;
use crate::alert::effects::{AlertNotification, Effect};
use crate::alert::matcher::{Field, Threshold, extract, matches};
use crate::storage::{
    AlertCondition, AlertEventQuery, AlertStore, ConditionStore, HostSample, NewAlertEvent,
    SampleKind, SampleQuery, SampleStore, StorageError,
};

/// Look-back window used when a condition does not set one (5 minutes).
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default broadcast channel for alert lifecycle messages.
pub const DEFAULT_ALERTS_CHANNEL: &str = "alerts";

/// Upper bound of samples scanned per condition and run.
const MAX_SAMPLES_PER_CONDITION: u32 = 50_000;

/// Resolver name recorded on events closed by the evaluator.
pub const SYSTEM_RESOLVER: &str = "system";

/// What happens to an open event once its host no longer meets the condition.
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
pub enum ClearPolicy {
    /// Leave the event open until someone resolves it.
    #[default]
    Manual,
    /// Resolve the event as the `system` user.
    AutoResolve,
}

/// Evaluator tuning.
#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub default_window: Duration,
    pub on_clear: ClearPolicy,
    pub alerts_channel: String,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            default_window: DEFAULT_TIME_WINDOW,
            on_clear: ClearPolicy::default(),
            alerts_channel: DEFAULT_ALERTS_CHANNEL.to_string(),
        }
    }
}

/// Verdict for one condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionResult {
    pub condition_id: i64,
    pub condition_name: String,
    pub triggered: bool,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// Hosts currently meeting the condition.
    pub hosts: Vec<String>,
    /// Alert events opened by this run.
    pub created_event_ids: Vec<i64>,
    /// Alert events closed by this run under the auto-resolve policy.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolved_event_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConditionResult {
    fn new(condition: &AlertCondition, now: DateTime<Utc>) -> Self {
        Self {
            condition_id: condition.id,
            condition_name: condition.name.clone(),
            triggered: false,
            timestamp: now,
            reason: String::new(),
            hosts: Vec::new(),
            created_event_ids: Vec::new(),
            resolved_event_ids: Vec::new(),
            error: None,
        }
    }
}

/// Output of one run: verdicts plus the effects to execute after commit.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub results: Vec<ConditionResult>,
    pub effects: Vec<Effect>,
}

impl Evaluation {
    pub fn triggered(&self) -> usize {
        self.results.iter().filter(|r| r.triggered).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }
}

#[derive(Default)]
struct HostTally<'a> {
    scanned: u32,
    matched: u32,
    latest_match: Option<&'a HostSample>,
}

/// Evaluates the condition catalog against stored telemetry.
#[derive(Debug, Clone)]
pub struct Evaluator {
    conditions: ConditionStore,
    samples: SampleStore,
    alerts: AlertStore,
    options: EvaluatorOptions,
}

impl Evaluator {
    pub fn new(
        conditions: ConditionStore,
        samples: SampleStore,
        alerts: AlertStore,
        options: EvaluatorOptions,
    ) -> Self {
        Self {
            conditions,
            samples,
            alerts,
            options,
        }
    }

    pub fn options(&self) -> &EvaluatorOptions {
        &self.options
    }

    /// Evaluate every enabled condition.
    ///
    /// A failing condition is reported in its own result; only a failure to
    /// read the catalog fails the whole run.
    pub async fn evaluate(&self) -> Result<Evaluation, EvaluationError> {
        let conditions = self
            .conditions
            .list(true)
            .await
            .map_err(EvaluationError::Catalog)?;

        let mut evaluation = Evaluation::default();
        for condition in &conditions {
            let now = Utc::now();
            let mut result = ConditionResult::new(condition, now);
            let mut effects = Vec::new();

            if let Err(e) = self
                .evaluate_condition(condition, now, &mut result, &mut effects)
                .await
            {
                tracing::warn!(
                    condition_id = condition.id,
                    condition = %condition.name,
                    error = %e,
                    "Condition evaluation failed"
                );
                result.error = Some(e.to_string());
                if result.reason.is_empty() {
                    result.reason = "Evaluation failed".to_string();
                }
            }

            evaluation.results.push(result);
            evaluation.effects.extend(effects);
        }

        tracing::debug!(
            conditions = evaluation.results.len(),
            triggered = evaluation.triggered(),
            failed = evaluation.failed(),
            "Evaluation finished"
        );
        Ok(evaluation)
    }

    async fn evaluate_condition(
        &self,
        condition: &AlertCondition,
        now: DateTime<Utc>,
        result: &mut ConditionResult,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EvaluationError> {
        if let (Some(interval), Some(last)) = (condition.repeat_interval, condition.last_triggered_at)
            && now.signed_duration_since(last).to_std().unwrap_or_default() < interval
        {
            result.reason = "Repeat interval not elapsed".to_string();
            return Ok(());
        }

        let threshold = Threshold::parse(condition.comparator, &condition.threshold)
            .map_err(EvaluationError::InvalidCondition)?;
        let field = Field::resolve(condition.source, &condition.field_name)
            .map_err(EvaluationError::InvalidCondition)?;

        let window = condition.time_window.unwrap_or(self.options.default_window);
        let since = now
            - chrono::Duration::from_std(window)
                .map_err(|e| EvaluationError::InvalidCondition(e.to_string()))?;

        let samples = self
            .samples
            .query(SampleQuery {
                kind: Some(condition.source),
                metric: (condition.source == SampleKind::Sensor)
                    .then(|| condition.field_name.clone()),
                since: Some(since),
                limit: Some(MAX_SAMPLES_PER_CONDITION),
                ..Default::default()
            })
            .await?;

        // Samples arrive newest first, so the first match per host is the latest
        let mut tallies: BTreeMap<&str, HostTally<'_>> = BTreeMap::new();
        for sample in &samples {
            let tally = tallies.entry(sample.hostname.as_str()).or_default();
            tally.scanned += 1;
            if matches(condition.comparator, &extract(field, &sample.payload), &threshold) {
                tally.matched += 1;
                tally.latest_match.get_or_insert(sample);
            }
        }

        let required = condition.count_threshold.unwrap_or(1).max(1);
        let mut created_any = false;

        for (host, tally) in &tallies {
            if tally.matched < required {
                continue;
            }
            let Some(sample) = tally.latest_match else {
                continue;
            };
            result.hosts.push((*host).to_string());

            let reason = host_reason(condition, tally.matched, window);
            let new_event = NewAlertEvent {
                condition_id: condition.id,
                host: (*host).to_string(),
                triggered_at: now,
                reason: reason.clone(),
                payload: json!({
                    "capturedAt": sample.captured_at,
                    "sample": sample.payload,
                    "matches": tally.matched,
                    "scanned": tally.scanned,
                }),
            };

            let Some(event) = self.alerts.create_if_absent(&new_event).await? else {
                tracing::debug!(condition_id = condition.id, host, "Alert already open");
                continue;
            };

            created_any = true;
            result.created_event_ids.push(event.id);
            tracing::info!(
                condition_id = condition.id,
                condition = %condition.name,
                host,
                event_id = event.id,
                "Alert event opened"
            );

            effects.push(Effect::Notify(AlertNotification {
                event_id: event.id,
                condition_id: condition.id,
                condition_name: condition.name.clone(),
                host: event.host.clone(),
                field_name: condition.field_name.clone(),
                comparator: condition.comparator,
                threshold: condition.threshold.clone(),
                reason,
                triggered_at: event.triggered_at,
                recipients: condition.recipients.clone(),
            }));
            effects.push(Effect::Broadcast {
                channel: self.options.alerts_channel.clone(),
                message: json!({
                    "type": "alert.triggered",
                    "condition": { "id": condition.id, "name": condition.name },
                    "event": event,
                }),
            });
        }

        if created_any {
            self.conditions.mark_triggered(condition.id, now).await?;
        }

        result.triggered = !result.hosts.is_empty();
        result.reason = summary_reason(condition, &tallies, &result.hosts, required);

        if self.options.on_clear == ClearPolicy::AutoResolve {
            let reporting: BTreeSet<&str> = tallies.keys().copied().collect();
            self.auto_resolve(condition, &reporting, now, result, effects)
                .await?;
        }

        Ok(())
    }

    /// Resolve open events of hosts that reported in the window without
    /// meeting the condition. Hosts that reported nothing keep their event.
    async fn auto_resolve(
        &self,
        condition: &AlertCondition,
        reporting: &BTreeSet<&str>,
        now: DateTime<Utc>,
        result: &mut ConditionResult,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EvaluationError> {
        let open = self
            .alerts
            .query(AlertEventQuery {
                resolved: Some(false),
                condition_id: Some(condition.id),
                limit: Some(10_000),
            })
            .await?;

        for event in open {
            if !reporting.contains(event.host.as_str()) || result.hosts.contains(&event.host) {
                continue;
            }
            match self
                .alerts
                .resolve(event.id, SYSTEM_RESOLVER, Some("Condition cleared"), now)
                .await
            {
                Ok(resolved) => {
                    tracing::info!(
                        condition_id = condition.id,
                        host = %resolved.host,
                        event_id = resolved.id,
                        "Alert event auto-resolved"
                    );
                    result.resolved_event_ids.push(resolved.id);
                    effects.push(Effect::Broadcast {
                        channel: self.options.alerts_channel.clone(),
                        message: json!({
                            "type": "alert.resolved",
                            "resolvedBy": SYSTEM_RESOLVER,
                            "eventIds": [resolved.id],
                            "count": 1,
                        }),
                    });
                }
                // Someone resolved it first
                Err(StorageError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn host_reason(condition: &AlertCondition, matched: u32, window: Duration) -> String {
    let window = humantime::format_duration(window);
    match condition.count_threshold {
        Some(limit) => format!(
            "{} {} {} matched {matched} times within {window} (limit: {limit})",
            condition.field_name, condition.comparator, condition.threshold
        ),
        None => format!(
            "{} {} {} matched {matched} times within {window}",
            condition.field_name, condition.comparator, condition.threshold
        ),
    }
}

fn summary_reason(
    condition: &AlertCondition,
    tallies: &BTreeMap<&str, HostTally<'_>>,
    hosts: &[String],
    required: u32,
) -> String {
    if tallies.is_empty() {
        return format!("No {} samples found in time window", condition.source);
    }
    if !hosts.is_empty() {
        return format!("Threshold met on {}", hosts.join(", "));
    }
    let best = tallies.values().map(|t| t.matched).max().unwrap_or(0);
    if best == 0 {
        "No threshold violations".to_string()
    } else {
        format!("Found {best} matching samples, but below limit of {required}")
    }
}
