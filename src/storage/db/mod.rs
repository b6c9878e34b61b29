//! Database abstraction layer.
//!
//! Currently supports SQLite only.
//!
//! # Example
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/hostwatch.db?mode=rwc", 5).await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

pub use sqlite::SqlitePool;
