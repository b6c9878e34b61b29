//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::Path;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::schema::init_schema;
use crate::storage::{AlertStore, ConditionStore, DeviceStore, EventStore, SampleStore};

/// Minimum connection pool size.
const MIN_POOL_SIZE: u32 = 2;

/// Maximum connection pool size.
const MAX_POOL_SIZE: u32 = 32;

/// Calculate default pool size based on available CPU parallelism.
///
/// Returns the number of available CPUs, clamped between MIN_POOL_SIZE and MAX_POOL_SIZE.
fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|p| (p.get() as u32).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE))
        .unwrap_or(4)
}

/// Extract the file path from a SQLite URL, or `None` for in-memory databases.
fn sqlite_file_path(url: &str) -> Option<&Path> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" || url.contains("mode=memory") {
        return None;
    }
    Some(Path::new(path))
}

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    pool_size: u32,
}

impl StorageBuilder {
    /// Create a new storage builder for a SQLite URL.
    ///
    /// Pool size defaults to the number of available CPUs (clamped to 2-32).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: default_pool_size(),
        }
    }

    /// Set the connection pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Build the storage layer and return handles.
    ///
    /// Creates the database directory and schema if they don't exist.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        if let Some(path) = sqlite_file_path(&self.url)
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pool = SqlitePool::connect(&self.url, self.pool_size).await?;
        init_schema(pool.inner()).await?;

        Ok(StorageHandles {
            samples: SampleStore::new(pool.clone()),
            devices: DeviceStore::new(pool.clone()),
            conditions: ConditionStore::new(pool.clone()),
            alerts: AlertStore::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            pool,
        })
    }
}

/// Handles to all storage layer facades.
#[derive(Debug, Clone)]
pub struct StorageHandles {
    /// Telemetry samples.
    pub samples: SampleStore,
    /// Discovered devices.
    pub devices: DeviceStore,
    /// Alert condition catalog.
    pub conditions: ConditionStore,
    /// Alert events.
    pub alerts: AlertStore,
    /// Activity log.
    pub events: EventStore,
    pool: SqlitePool,
}

impl StorageHandles {
    /// Check the database answers a trivial query.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(self.pool.inner()).await?;
        Ok(())
    }

    /// Gracefully shutdown the storage layer.
    ///
    /// Waits for checked-out connections to be returned, then closes the pool.
    pub async fn shutdown(self) {
        self.pool.close().await;
    }
}
