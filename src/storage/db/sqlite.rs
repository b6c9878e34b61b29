//! SQLite backend implementation using sqlx.
//!
//! Provides connection pooling and database operations for SQLite.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool as SqlxPool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::storage::StorageError;

/// Default maximum connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite connection pool wrapper.
///
/// Wraps sqlx's SqlitePool with sensible defaults for WAL mode and connection pooling.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool").finish_non_exhaustive()
    }
}

/// Whether the URL points at a private in-memory database.
fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

impl SqlitePool {
    /// Connect to a SQLite database.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL, e.g., `sqlite:data/hostwatch.db?mode=rwc`
    /// * `max_connections` - upper bound on pooled connections
    ///
    /// # Configuration
    ///
    /// - WAL journal mode for better concurrency
    /// - Normal synchronous mode for performance with durability
    /// - Create database if not exists (mode=rwc)
    /// - In-memory databases are pinned to one connection that is never
    ///   recycled, otherwise each connection would see its own empty database
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(DEFAULT_CONNECT_TIMEOUT);
        if is_memory_url(url) {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(max_connections.max(1));
        }

        let pool = pool_options.connect_with(options).await?;
        tracing::debug!(url, "SQLite pool connected");

        Ok(Self { inner: pool })
    }

    /// Get the underlying sqlx pool for direct query execution.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_pool_connect() {
        let pool = SqlitePool::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS)
            .await
            .unwrap();
        assert!(!pool.is_closed());

        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 1);

        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_memory_database_survives_between_queries() {
        let pool = SqlitePool::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS)
            .await
            .unwrap();

        sqlx::query("CREATE TABLE t (v INTEGER)")
            .execute(pool.inner())
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (7)")
            .execute(pool.inner())
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT v FROM t")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 7);
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("wal.db").display());
        let pool = SqlitePool::connect(&url, 2).await.unwrap();

        let row: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, "wal");

        pool.close().await;
    }

    #[test]
    fn test_is_memory_url() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite:file:test?mode=memory&cache=shared"));
        assert!(!is_memory_url("sqlite:data/hostwatch.db?mode=rwc"));
    }
}
