//! Evaluation followed by its side effects.

use std::time::Instant;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::alert::EvaluationError;
use crate::alert::effects::{EffectRunner, EffectSummary};
use crate::alert::evaluator::{ConditionResult, Evaluator};

/// What started an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Trigger {
    /// Periodic scheduler tick.
    Schedule,
    /// Authenticated external trigger.
    Api,
    /// Unauthenticated debug endpoint.
    Debug,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub trigger: Trigger,
    pub results: Vec<ConditionResult>,
    pub effects: EffectSummary,
    pub duration_ms: u128,
}

impl PipelineRun {
    pub fn triggered(&self) -> usize {
        self.results.iter().filter(|r| r.triggered).count()
    }
}

/// Runs the evaluator, then executes the effects it produced.
///
/// Effects only run once every write of the evaluation has been committed.
#[derive(Debug, Clone)]
pub struct AlertPipeline {
    evaluator: Evaluator,
    effects: EffectRunner,
}

impl AlertPipeline {
    pub fn new(evaluator: Evaluator, effects: EffectRunner) -> Self {
        Self { evaluator, effects }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub async fn run(&self, trigger: Trigger) -> Result<PipelineRun, EvaluationError> {
        let start = Instant::now();
        tracing::debug!(%trigger, "Running alert evaluation");

        let evaluation = self.evaluator.evaluate().await?;
        let effects = self.effects.run(evaluation.effects).await;
        let run = PipelineRun {
            trigger,
            results: evaluation.results,
            effects,
            duration_ms: start.elapsed().as_millis(),
        };

        tracing::info!(
            %trigger,
            conditions = run.results.len(),
            triggered = run.triggered(),
            notified = run.effects.notified,
            notify_failed = run.effects.notify_failed,
            duration_ms = run.duration_ms,
            "Alert evaluation completed"
        );
        Ok(run)
    }
}
