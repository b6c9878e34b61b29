//! Periodic driver of the alert pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::alert::pipeline::{AlertPipeline, Trigger};
use crate::storage::{Event, EventKind, EventSeverity, EventStore};

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEDULER_EVENT_SOURCE: &str = "alert.scheduler";

/// Errors raised by the evaluation scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid schedule definition.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying job scheduler failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// When the evaluator runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval between runs, at least [`MIN_INTERVAL`].
    Interval(Duration),

    /// Cron expression, 6-field: `sec min hour day month weekday`.
    /// Example: `"0 */5 * * * *"` = every 5 minutes at second 0
    Cron(String),
}

impl Schedule {
    /// Create an interval schedule, clamped to [`MIN_INTERVAL`].
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }

    /// Create a cron schedule with immediate validation.
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, SchedulerError> {
        use std::str::FromStr;

        let expr = expr.as_ref().trim();
        cron::Schedule::from_str(expr)
            .map_err(|e| SchedulerError::Config(format!("invalid cron expression: {e}")))?;
        Ok(Self::Cron(expr.to_string()))
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {:?}", d),
            Self::Cron(expr) => write!(f, "cron: {}", expr),
        }
    }
}

/// Runs the alert pipeline on a schedule.
///
/// A tick that fires while the previous scheduled run is still going is
/// skipped. Manual triggers are not affected.
pub struct EvaluationScheduler {
    scheduler: JobScheduler,
    job_id: uuid::Uuid,
    schedule: Schedule,
    events: EventStore,
}

impl std::fmt::Debug for EvaluationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationScheduler")
            .field("job_id", &self.job_id)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl EvaluationScheduler {
    /// Register the evaluation job. Call [`start`](Self::start) to begin ticking.
    pub async fn new(
        pipeline: AlertPipeline,
        events: EventStore,
        schedule: Schedule,
    ) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        let job = create_job(pipeline, events.clone(), &schedule);
        let job_id = match job {
            Ok(job) => scheduler
                .add(job)
                .await
                .map_err(|e| SchedulerError::Scheduler(e.to_string())),
            Err(e) => Err(e),
        };
        let job_id = match job_id {
            Ok(id) => id,
            Err(e) => {
                emit(
                    &events,
                    EventKind::Error,
                    EventSeverity::Error,
                    "Evaluation job registration failed",
                    serde_json::json!({ "schedule": schedule.to_string(), "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
        };

        tracing::info!(job_id = %job_id, schedule = %schedule, "Evaluation job registered");
        Ok(Self {
            scheduler,
            job_id,
            schedule,
            events,
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        emit(
            &self.events,
            EventKind::System,
            EventSeverity::Info,
            "Evaluation scheduler started",
            serde_json::json!({ "schedule": self.schedule.to_string() }),
        )
        .await;
        tracing::info!(schedule = %self.schedule, "Evaluation scheduler started");
        Ok(())
    }

    /// Gracefully shutdown the scheduler with default timeout.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout.
    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), SchedulerError> {
        let result = tokio::time::timeout(timeout, async {
            self.scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::Scheduler(e.to_string()))
        })
        .await;

        let timed_out = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                emit(
                    &self.events,
                    EventKind::Error,
                    EventSeverity::Error,
                    "Evaluation scheduler shutdown failed",
                    serde_json::json!({ "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
            Err(_) => true,
        };

        let (severity, msg) = if timed_out {
            tracing::warn!("Evaluation scheduler shutdown timed out");
            (EventSeverity::Warn, "Evaluation scheduler shutdown timed out")
        } else {
            tracing::info!("Evaluation scheduler shutdown complete");
            (EventSeverity::Info, "Evaluation scheduler shutdown complete")
        };
        emit(
            &self.events,
            EventKind::System,
            severity,
            msg,
            serde_json::json!({ "timed_out": timed_out }),
        )
        .await;
        Ok(())
    }
}

fn create_job(
    pipeline: AlertPipeline,
    events: EventStore,
    schedule: &Schedule,
) -> Result<Job, SchedulerError> {
    let running = Arc::new(AtomicBool::new(false));

    let callback = move |_: uuid::Uuid, _: JobScheduler| {
        let (pipeline, events, running) = (pipeline.clone(), events.clone(), Arc::clone(&running));
        Box::pin(async move { run_tick(&pipeline, &events, &running).await })
            as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    };

    match schedule {
        Schedule::Interval(d) => Job::new_repeated_async(*d, callback),
        Schedule::Cron(expr) => Job::new_cron_job_async(expr, callback),
    }
    .map_err(|e| SchedulerError::Scheduler(e.to_string()))
}

/// Holds the overlap flag for one run and clears it on drop, unwinding included.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        (!running.swap(true, Ordering::AcqRel)).then(|| Self(running))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Execute one scheduled run and record failures.
async fn run_tick(pipeline: &AlertPipeline, events: &EventStore, running: &AtomicBool) {
    let Some(_guard) = RunGuard::acquire(running) else {
        tracing::debug!("Previous evaluation still running, skipping tick");
        return;
    };

    if let Err(e) = pipeline.run(Trigger::Schedule).await {
        tracing::error!(error = %e, "Scheduled evaluation failed");
        emit(
            events,
            EventKind::Error,
            EventSeverity::Error,
            format!("Scheduled evaluation failed: {e}"),
            serde_json::json!({ "error": e.to_string() }),
        )
        .await;
    }
}

async fn emit(
    events: &EventStore,
    kind: EventKind,
    severity: EventSeverity,
    message: impl Into<String>,
    details: serde_json::Value,
) {
    let event = Event::new(SCHEDULER_EVENT_SOURCE, kind, severity, message)
        .with_payload("details", details);
    if let Err(e) = events.insert(&event).await {
        tracing::warn!(error = %e, "Failed to record scheduler event");
    }
}
