//! Hostwatch - Host Telemetry and Alerting Library
//!
//! This crate provides the core functionality for the hostwatch service.
//! It can be used as a library by other Rust projects, or run as a standalone
//! binary with the `hostwatch` executable.
//!
//! # Architecture
//!
//! - **Ingest**: Validated, idempotent writes of agent telemetry and device heartbeats
//! - **Storage**: SQLite persistence for samples, devices, conditions, alert events and the activity log
//! - **Alert**: Condition evaluation, effects, resolution and scheduling
//! - **Broadcast**: In-process channel fan-out for live subscribers
//! - **Server**: REST API and server-sent event stream
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hostwatch::{alert::LogNotifier, config::AppConfig, server, storage::StorageBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("configs/config.yaml")?;
//!     let handles = StorageBuilder::new(&config.database.dsn).build().await?;
//!     let state = server::AppState::new(handles, &config, Arc::new(LogNotifier));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, server::create_router(state)).await?;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod ingest;
pub mod server;
pub mod storage;

pub use broadcast::{Broadcaster, Subscription};
pub use storage::{StorageBuilder, StorageError, StorageHandles};
