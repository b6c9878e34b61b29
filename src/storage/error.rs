//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, missing row, conflict, etc.).

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write rejected by a uniqueness or state constraint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal error (e.g., directory creation failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data in database (e.g., unknown enum value).
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StorageError {
    /// Whether this error was raised by a UNIQUE constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            Self::Conflict(_) => true,
            _ => false,
        }
    }
}
