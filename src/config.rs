//! Configuration module for hostwatch.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (SQLite URL, pool size)
//! - Alert evaluation, ingestion, broadcasting, sessions and notifications
//! - Alert condition definitions, inline or from a directory

mod app;
mod conditions;
mod validation;

pub use app::{
    AppConfig, AuthConfig, BroadcastConfig, DEFAULT_EVALUATION_INTERVAL, DEFAULT_MAX_BATCH,
    DEFAULT_MAX_CONNECTIONS, DatabaseConfig, EvaluationConfig, IngestConfig, NotifierConfig,
    ServerConfig,
};
pub use conditions::ConditionsConfig;
pub use validation::{ConfigError, expand_env_vars, parse_duration};
