//! Application configuration structures.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alert::{
    ClearPolicy, DEFAULT_ALERTS_CHANNEL, DEFAULT_TIME_WINDOW, DEFAULT_WEBHOOK_TIMEOUT,
    EvaluatorOptions, Schedule,
};
use crate::broadcast::DEFAULT_SINK_CAPACITY;
use crate::ingest::DeviceRefreshPolicy;
use crate::storage::NewCondition;

use super::conditions::ConditionsConfig;
use super::validation::{ConfigError, expand_env_vars, non_blank};

// =============================================================================
// Constants
// =============================================================================

/// Default evaluation interval (1 minute).
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(60);

/// Default database connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default cap on elements per telemetry collection.
pub const DEFAULT_MAX_BATCH: usize = 5_000;

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_window() -> Duration {
    DEFAULT_TIME_WINDOW
}

fn default_alerts_channel() -> String {
    DEFAULT_ALERTS_CHANNEL.to_string()
}

fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}

fn default_sink_capacity() -> usize {
    DEFAULT_SINK_CAPACITY
}

fn default_webhook_timeout() -> Duration {
    DEFAULT_WEBHOOK_TIMEOUT
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    pub dsn: String,

    /// Connection pool size (default: 5). In-memory databases always use one.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite:data/hostwatch.db?mode=rwc".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// =============================================================================
// Evaluation Configuration
// =============================================================================

/// Alert evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Fixed interval between scheduled runs. Mutually exclusive with `cron`.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// 6-field cron expression for scheduled runs.
    #[serde(default)]
    pub cron: Option<String>,

    /// Look-back window of conditions that do not set one (default: 5m).
    #[serde(default = "default_window", with = "humantime_serde")]
    pub default_window: Duration,

    /// What happens to open events whose condition cleared.
    #[serde(default)]
    pub on_clear: ClearPolicy,

    /// Shared secret of the external evaluation trigger. Unset denies it.
    #[serde(default)]
    pub trigger_secret: Option<String>,

    /// Broadcast channel for alert lifecycle messages.
    #[serde(default = "default_alerts_channel")]
    pub alerts_channel: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval: None,
            cron: None,
            default_window: DEFAULT_TIME_WINDOW,
            on_clear: ClearPolicy::default(),
            trigger_secret: None,
            alerts_channel: default_alerts_channel(),
        }
    }
}

impl EvaluationConfig {
    /// Scheduler timing; the default interval applies when neither is set.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        match (self.interval, non_blank(&self.cron)) {
            (Some(_), Some(_)) => Err(ConfigError::invalid(
                "evaluation: cannot specify both interval and cron",
            )),
            (_, Some(expr)) => {
                Schedule::cron(expr).map_err(|e| ConfigError::invalid(format!("evaluation: {e}")))
            }
            (Some(interval), None) => Ok(Schedule::interval(interval)),
            (None, None) => Ok(Schedule::interval(DEFAULT_EVALUATION_INTERVAL)),
        }
    }

    pub fn trigger_secret(&self) -> Option<&str> {
        non_blank(&self.trigger_secret)
    }

    pub fn evaluator_options(&self) -> EvaluatorOptions {
        EvaluatorOptions {
            default_window: self.default_window,
            on_clear: self.on_clear,
            alerts_channel: self.alerts_channel.clone(),
        }
    }
}

// =============================================================================
// Ingest / Broadcast / Auth / Notifier
// =============================================================================

/// Telemetry ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub device_refresh: DeviceRefreshPolicy,

    /// Maximum elements per collection in one push (default: 5000).
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            device_refresh: DeviceRefreshPolicy::default(),
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// Event broadcaster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Per-subscriber queue capacity (default: 256).
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

/// Session table: bearer token to username.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub sessions: HashMap<String, String>,
}

/// Outbound notification transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    /// Log notifications only.
    #[default]
    Log,
    /// POST notifications as JSON to `url`.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Alert conditions seeded into the catalog on startup.
    #[serde(default)]
    pub conditions: Vec<NewCondition>,

    /// Directory with additional condition files.
    #[serde(default)]
    pub condition_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` references are expanded before parsing. Condition files under
    /// `condition_path` are merged into `conditions`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_yaml(&content)?;

        if let Some(dir) = config.condition_path.clone() {
            let extra = ConditionsConfig::load_from_dir(&dir)?;
            config.conditions.extend(extra.conditions);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without touching the filesystem.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(&expand_env_vars(content))?)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::invalid(format!("invalid server bind address: '{}'", self.server.bind))
        })?;
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server port must be non-zero"));
        }

        if !self.database.dsn.starts_with("sqlite:") {
            return Err(ConfigError::invalid(format!(
                "database dsn must be a sqlite URL: '{}'",
                self.database.dsn
            )));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database max_connections must be positive"));
        }

        self.evaluation.schedule()?;
        if self.evaluation.default_window.is_zero() {
            return Err(ConfigError::invalid("evaluation default_window must be positive"));
        }
        if self.evaluation.alerts_channel.trim().is_empty() {
            return Err(ConfigError::invalid("evaluation alerts_channel cannot be empty"));
        }

        if self.ingest.max_batch == 0 {
            return Err(ConfigError::invalid("ingest max_batch must be positive"));
        }
        if self.broadcast.sink_capacity == 0 {
            return Err(ConfigError::invalid("broadcast sink_capacity must be positive"));
        }

        if let NotifierConfig::Webhook { url, .. } = &self.notifier
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(ConfigError::invalid(format!(
                "notifier webhook url must be http(s): '{url}'"
            )));
        }

        ConditionsConfig {
            conditions: self.conditions.clone(),
        }
        .validate()
    }
}
