//! Alert Layer
//!
//! Evaluation of alert conditions against stored telemetry, post-commit side
//! effects, and the resolution workflow.
//!
//! # Architecture
//!
//! - [`Evaluator`]: scans the catalog and opens deduplicated alert events
//! - [`EffectRunner`]: delivers notifications and broadcasts after commit
//! - [`AlertPipeline`]: evaluator followed by its effects
//! - [`EvaluationScheduler`]: periodic driver of the pipeline
//! - [`ResolutionWorkflow`]: single and bulk acknowledgement with audit

mod effects;
mod evaluator;
mod matcher;
mod notifier;
mod pipeline;
mod resolution;
mod scheduler;

use thiserror::Error;

use crate::storage::StorageError;

pub use effects::{AlertNotification, Effect, EffectRunner, EffectSummary};
pub use evaluator::{
    ClearPolicy, ConditionResult, DEFAULT_ALERTS_CHANNEL, DEFAULT_TIME_WINDOW, Evaluation,
    Evaluator, EvaluatorOptions, SYSTEM_RESOLVER,
};
pub use matcher::{Field, FieldValue, Threshold, extract, matches};
pub use notifier::{DEFAULT_WEBHOOK_TIMEOUT, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use pipeline::{AlertPipeline, PipelineRun, Trigger};
pub use resolution::{DEFAULT_BULK_NOTES, ResolutionError, ResolutionWorkflow};
pub use scheduler::{DEFAULT_SHUTDOWN_TIMEOUT, EvaluationScheduler, MIN_INTERVAL, Schedule, SchedulerError};

/// Errors raised by an evaluation run.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The condition catalog could not be read; nothing was evaluated.
    #[error("failed to load alert conditions: {0}")]
    Catalog(#[source] StorageError),

    /// A condition cannot be evaluated as configured.
    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    /// Storage failure while evaluating a condition.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
