//! Storage Layer
//!
//! SQLite storage through a `sqlx` connection pool, split into one facade per
//! table family.
//!
//! # Components
//!
//! - [`SampleStore`]: Append-only telemetry samples with duplicate suppression
//! - [`DeviceStore`]: Device records keyed by IP address
//! - [`ConditionStore`]: Alert condition catalog and config sync
//! - [`AlertStore`]: Alert events with the one-open-event-per-key invariant
//! - [`EventStore`]: Activity log (audit, system, error events)
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

pub mod alert_store;
mod builder;
pub mod condition_store;
pub mod db;
pub mod device_store;
mod error;
pub mod event_store;
pub mod sample_store;
mod schema;
mod types;

pub use alert_store::{AlertEvent, AlertEventQuery, AlertStore, NewAlertEvent, dedup_key};
pub use builder::{StorageBuilder, StorageHandles};
pub use condition_store::{AlertCondition, ConditionStore, NewCondition, SyncResult};
pub use device_store::DeviceStore;
pub use error::StorageError;
pub use event_store::{EventQuery, EventStore, SortOrder};
pub use sample_store::{InsertOutcome, SampleQuery, SampleStore};
pub use types::{
    Comparator, Device, DeviceDiscovery, DeviceStatus, DiskSample, Event, EventKind, EventPayload,
    EventSeverity, HostSample, ProcessSample, SampleKind, SamplePayload, SensorSample,
    SensorValueType,
};
