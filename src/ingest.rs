//! Telemetry ingestion.
//!
//! Agents push process, sensor and disk snapshots plus device discovery
//! heartbeats. Payloads are validated into tagged samples before any write;
//! each collection is then written in its own transaction.
//!
//! # Components
//!
//! - [`TelemetryBatch`]: Raw push payload and its validation
//! - [`IngestGateway`]: Idempotent writes into the telemetry store
//! - [`DeviceRefreshPolicy`]: What a heartbeat does to an already known device

mod gateway;
mod payload;

use thiserror::Error;

use crate::storage::StorageError;

pub use gateway::{DeviceRefreshPolicy, DeviceUpsert, IngestGateway, IngestReport};
pub use payload::{TelemetryBatch, ValidatedBatch, classify_sensor, validate_discovery};

/// Errors raised while ingesting telemetry.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Payload rejected before any write.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store failure while writing.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
