//! Hostwatch Binary Entry Point
//!
//! This binary runs the ingestion API, alert scheduler and event stream.
//! Core functionality is provided by the `hostwatch` library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use hostwatch::{
    StorageHandles,
    alert::{
        DEFAULT_SHUTDOWN_TIMEOUT, EvaluationScheduler, LogNotifier, Notifier, WebhookNotifier,
    },
    config::{AppConfig, NotifierConfig},
    server::{AppState, create_router},
    storage::{Event, EventKind, EventSeverity, StorageBuilder},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SYSTEM_EVENT_SOURCE: &str = "system";

/// Hostwatch - Host Telemetry and Alerting Service
#[derive(Parser, Debug)]
#[command(name = "hostwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "HOSTWATCH_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "HOSTWATCH_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "HOSTWATCH_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "HOSTWATCH_DB_URL")]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hostwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Hostwatch - Host Telemetry and Alerting Service");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(dsn) = cli.db_url {
        config.database.dsn = dsn;
    }
    config.validate()?;

    tracing::info!(
        bind = %config.server.bind,
        port = config.server.port,
        dsn = %config.database.dsn,
        "Configuration loaded"
    );

    let handles = StorageBuilder::new(&config.database.dsn)
        .pool_size(config.database.max_connections)
        .build()
        .await?;
    tracing::info!("Storage initialized");

    // Seed conditions from config (insert only, no updates)
    let sync = handles.conditions.sync_from_config(&config.conditions).await?;
    tracing::info!(
        added = sync.added,
        skipped = sync.skipped,
        "Alert condition sync complete"
    );

    let notifier: Arc<dyn Notifier> = match &config.notifier {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Webhook { url, timeout } => {
            Arc::new(WebhookNotifier::new(url.clone(), *timeout)?)
        }
    };

    let state = AppState::new(handles.clone(), &config, notifier);
    if config.evaluation.trigger_secret().is_none() {
        tracing::warn!("No trigger secret configured, external evaluation triggers are disabled");
    }

    let schedule = config.evaluation.schedule()?;
    tracing::info!(%schedule, "Starting alert scheduler");
    let scheduler =
        EvaluationScheduler::new(state.pipeline.clone(), handles.events.clone(), schedule).await?;
    scheduler.start().await?;

    record_system_event(&handles, "Service started").await;

    let app = create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler, handles))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn record_system_event(handles: &StorageHandles, message: &str) {
    let event = Event::new(
        SYSTEM_EVENT_SOURCE,
        EventKind::System,
        EventSeverity::Info,
        message,
    );
    if let Err(e) = handles.events.insert(&event).await {
        tracing::warn!(error = %e, "Failed to record system event");
    }
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal(scheduler: EvaluationScheduler, handles: StorageHandles) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    record_system_event(&handles, "Service stopping").await;

    tracing::info!("Shutting down alert scheduler...");
    if let Err(e) = scheduler.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await {
        tracing::error!(error = %e, "Failed to shutdown alert scheduler");
    }

    tracing::info!("Shutting down storage...");
    handles.shutdown().await;
}
