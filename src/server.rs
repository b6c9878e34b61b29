//! Web server module for hostwatch.
//!
//! Exposes the ingestion, evaluation, resolution and streaming endpoints plus
//! read APIs over the activity log, alert events, conditions and devices.

mod error;
mod stream;

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::alert::{
    AlertPipeline, EffectRunner, Evaluator, Field, Notifier, PipelineRun, ResolutionWorkflow,
    Threshold, Trigger,
};
use crate::auth::{Actor, SessionResolver, StaticSessions, bearer_token, secret_matches};
use crate::broadcast::Broadcaster;
use crate::config::AppConfig;
use crate::ingest::{IngestGateway, TelemetryBatch};
use crate::storage::{
    AlertEventQuery, DeviceDiscovery, Event, EventKind, EventQuery, EventSeverity, NewCondition,
    SortOrder, StorageHandles,
};

pub use error::ApiError;

const CATALOG_EVENT_SOURCE: &str = "alert.catalog";

/// Shared application state.
pub struct AppState {
    pub storage: StorageHandles,
    pub gateway: IngestGateway,
    pub pipeline: AlertPipeline,
    pub resolution: ResolutionWorkflow,
    pub broadcaster: Broadcaster,
    pub sessions: Arc<dyn SessionResolver>,
    trigger_secret: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("broadcaster", &self.broadcaster)
            .field("trigger_secret_set", &self.trigger_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire every component from configuration.
    pub fn new(storage: StorageHandles, config: &AppConfig, notifier: Arc<dyn Notifier>) -> Self {
        let broadcaster = Broadcaster::new(config.broadcast.sink_capacity);
        let alerts_channel = config.evaluation.alerts_channel.clone();

        let gateway = IngestGateway::new(
            storage.samples.clone(),
            storage.devices.clone(),
            config.ingest.device_refresh,
            config.ingest.max_batch,
        );
        let pipeline = AlertPipeline::new(
            Evaluator::new(
                storage.conditions.clone(),
                storage.samples.clone(),
                storage.alerts.clone(),
                config.evaluation.evaluator_options(),
            ),
            EffectRunner::new(notifier, broadcaster.clone(), storage.events.clone()),
        );
        let resolution = ResolutionWorkflow::new(
            storage.alerts.clone(),
            storage.events.clone(),
            broadcaster.clone(),
            alerts_channel,
        );

        Self {
            gateway,
            pipeline,
            resolution,
            broadcaster,
            sessions: Arc::new(StaticSessions::new(config.auth.sessions.clone())),
            trigger_secret: config.evaluation.trigger_secret().map(str::to_string),
            storage,
        }
    }

    /// Replace the session resolver.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionResolver>) -> Self {
        self.sessions = sessions;
        self
    }
}

impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .and_then(|token| state.sessions.resolve(token))
            .ok_or_else(ApiError::unauthorized)
    }
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/deviceinfo", post(deviceinfo_handler))
        .route("/api/devices", get(list_devices_handler).post(register_device_handler))
        .route("/api/cron/evaluate-alerts", get(trigger_evaluation_handler))
        .route("/api/alerts/check", get(check_alerts_handler))
        .route("/api/alerts/resolve-all", post(resolve_all_handler))
        .route("/api/alerts/events", get(alert_events_handler))
        .route("/api/alerts/events/{id}/resolve", post(resolve_event_handler))
        .route(
            "/api/alerts/conditions",
            get(list_conditions_handler).post(create_condition_handler),
        )
        .route("/api/alerts/conditions/{id}/enabled", post(set_condition_enabled_handler))
        .route("/api/events", get(events_handler))
        .route("/api/stream", get(stream::stream_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Parse an optional JSON body; an empty body yields the default value.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Parse filtered time range from string.
/// Supports: 1h, 6h, 12h, 24h, 7d, 30d.
fn parse_range(range: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>, ApiError> {
    let Some(range) = range else {
        return Ok(None);
    };
    let now = chrono::Utc::now();
    let start = match range {
        "1h" => now - chrono::Duration::hours(1),
        "6h" => now - chrono::Duration::hours(6),
        "12h" => now - chrono::Duration::hours(12),
        "24h" => now - chrono::Duration::hours(24),
        "7d" => now - chrono::Duration::days(7),
        "30d" => now - chrono::Duration::days(30),
        other => return Err(ApiError::BadRequest(format!("invalid range '{other}'"))),
    };
    Ok(Some(start))
}

fn parse_param<T: FromStr>(name: &str, value: Option<&str>) -> Result<Option<T>, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| ApiError::BadRequest(format!("invalid {name} '{v}'")))
        })
        .transpose()
}

async fn record_audit(state: &AppState, actor: &Actor, message: String, details: Value) {
    let event = Event::new(CATALOG_EVENT_SOURCE, EventKind::Audit, EventSeverity::Info, message)
        .with_payload("actor", actor.username.as_str())
        .with_payload("details", details);
    if let Err(e) = state.storage.events.insert(&event).await {
        tracing::warn!(error = %e, "Failed to record audit event");
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks database availability.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Ingestion
// =============================================================================

async fn deviceinfo_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TelemetryBatch>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(batch) = payload?;
    let report = state.gateway.ingest_telemetry(batch).await?;
    Ok(Json(json!({
        "status": "success",
        "hostname": report.hostname,
        "inserted": report.inserted(),
        "processes": report.processes,
        "sensors": report.sensors,
        "disks": report.disks,
    })))
}

async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeviceDiscovery>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(discovery) = payload?;
    let upsert = state.gateway.register_device(discovery).await?;
    Ok(Json(json!({
        "status": "success",
        "created": upsert.created,
        "device": upsert.device,
    })))
}

async fn list_devices_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let devices = state.gateway.devices().await?;
    Ok(Json(json!({ "success": true, "devices": devices })))
}

// =============================================================================
// Evaluation
// =============================================================================

fn evaluation_response(run: PipelineRun) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": format!(
            "Evaluated {} conditions, {} triggered",
            run.results.len(),
            run.triggered()
        ),
        "results": run.results,
    }))
}

/// External trigger guarded by the shared secret.
async fn trigger_evaluation_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, ApiError> {
    if !secret_matches(state.trigger_secret.as_deref(), bearer_token(&headers)) {
        tracing::warn!("Rejected evaluation trigger with missing or wrong secret");
        return Err(ApiError::unauthorized());
    }
    let run = state.pipeline.run(Trigger::Api).await?;
    Ok(evaluation_response(run))
}

/// Unauthenticated evaluation, meant for debugging.
async fn check_alerts_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let run = state.pipeline.run(Trigger::Debug).await?;
    Ok(evaluation_response(run))
}

// =============================================================================
// Resolution
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ResolveBody {
    notes: Option<String>,
}

async fn resolve_all_handler(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: ResolveBody = optional_json(&body)?;
    let count = state
        .resolution
        .resolve_all(&actor, body.notes.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Resolved {count} alert events"),
        "count": count,
    })))
}

async fn resolve_event_handler(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    id: Result<Path<i64>, axum::extract::rejection::PathRejection>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Path(id) = id?;
    let body: ResolveBody = optional_json(&body)?;
    let event = state
        .resolution
        .resolve_one(&actor, id, body.notes.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Resolved alert event {id}"),
        "event": event,
    })))
}

#[derive(Debug, Deserialize)]
struct AlertEventsParams {
    resolved: Option<bool>,
    condition_id: Option<i64>,
    limit: Option<u32>,
}

async fn alert_events_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<AlertEventsParams>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params?;
    let events = state
        .storage
        .alerts
        .query(AlertEventQuery {
            resolved: params.resolved,
            condition_id: params.condition_id,
            limit: params.limit,
        })
        .await?;
    Ok(Json(json!({ "success": true, "count": events.len(), "events": events })))
}

// =============================================================================
// Condition catalog
// =============================================================================

async fn list_conditions_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let conditions = state.storage.conditions.list(false).await?;
    Ok(Json(json!({ "success": true, "conditions": conditions })))
}

async fn create_condition_handler(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    payload: Result<Json<NewCondition>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(condition) = payload?;
    condition.validate().map_err(ApiError::BadRequest)?;
    Field::resolve(condition.source, &condition.field_name).map_err(ApiError::BadRequest)?;
    Threshold::parse(condition.comparator, &condition.threshold).map_err(ApiError::BadRequest)?;

    let created = state.storage.conditions.insert(&condition).await?;
    tracing::info!(condition_id = created.id, name = %created.name, actor = %actor.username, "Alert condition created");
    record_audit(
        &state,
        &actor,
        format!("Created alert condition '{}'", created.name),
        json!({ "condition_id": created.id, "action": "create" }),
    )
    .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "condition": created })),
    ))
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_condition_enabled_handler(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    id: Result<Path<i64>, axum::extract::rejection::PathRejection>,
    payload: Result<Json<EnabledBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(id) = id?;
    let Json(body) = payload?;

    let condition = state.storage.conditions.set_enabled(id, body.enabled).await?;
    record_audit(
        &state,
        &actor,
        format!(
            "{} alert condition '{}'",
            if body.enabled { "Enabled" } else { "Disabled" },
            condition.name
        ),
        json!({ "condition_id": id, "action": "set_enabled", "enabled": body.enabled }),
    )
    .await;

    Ok(Json(json!({ "success": true, "condition": condition })))
}

// =============================================================================
// Activity log
// =============================================================================

/// Query parameters for events API.
#[derive(Debug, Deserialize)]
struct EventsQueryParams {
    source: Option<String>,
    kind: Option<String>,
    severity: Option<String>,
    limit: Option<u32>,
    order: Option<String>,
    range: Option<String>,
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<EventsQueryParams>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params?;
    let query = EventQuery {
        start: parse_range(params.range.as_deref())?,
        end: None,
        source: params.source.filter(|s| !s.is_empty()),
        kind: parse_param::<EventKind>("kind", params.kind.as_deref())?,
        severity: parse_param::<EventSeverity>("severity", params.severity.as_deref())?,
        limit: params.limit,
        order: parse_param::<SortOrder>("order", params.order.as_deref())?,
    };
    let events = state.storage.events.query(query).await?;
    Ok(Json(json!({ "success": true, "events": events })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogNotifier;
    use crate::storage::StorageBuilder;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn create_test_router(yaml: &str) -> (Router, StorageHandles) {
        let handles = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
        let config = AppConfig::from_yaml(yaml).unwrap();
        let state = AppState::new(handles.clone(), &config, Arc::new(LogNotifier));
        (create_router(state), handles)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Open an alert event for `host` under a freshly seeded condition.
    async fn open_alert(handles: &StorageHandles, host: &str) -> crate::storage::AlertEvent {
        let condition: NewCondition = serde_json::from_value(json!({
            "name": format!("hot-cpu-{host}"),
            "source": "sensor",
            "field_name": "cpu_temp",
            "comparator": ">",
            "threshold": 90,
        }))
        .unwrap();
        let condition = handles.conditions.insert(&condition).await.unwrap();
        handles
            .alerts
            .create_if_absent(&crate::storage::NewAlertEvent {
                condition_id: condition.id,
                host: host.to_string(),
                triggered_at: chrono::Utc::now(),
                reason: "test".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap()
            .unwrap()
    }

    const CONFIG: &str = "evaluation:\n  trigger_secret: s3cret\nauth:\n  sessions:\n    tok-alice: alice\n";

    #[tokio::test]
    async fn test_ingest_validation_error() {
        let (app, _) = create_test_router(CONFIG).await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/deviceinfo",
            None,
            Some(json!({ "hostname": "  ", "sensors": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (app, _) = create_test_router(CONFIG).await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/deviceinfo")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_requires_secret() {
        let (app, _) = create_test_router(CONFIG).await;
        let (status, _) = send(&app, Method::GET, "/api/cron/evaluate-alerts", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&app, Method::GET, "/api/cron/evaluate-alerts", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            send(&app, Method::GET, "/api/cron/evaluate-alerts", Some("s3cret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["results"], json!([]));
    }

    #[tokio::test]
    async fn test_trigger_denied_without_configured_secret() {
        let (app, _) = create_test_router("{}").await;
        let (status, _) = send(&app, Method::GET, "/api/cron/evaluate-alerts", Some(""), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_resolve_requires_session_before_side_effects() {
        let (app, handles) = create_test_router(CONFIG).await;
        open_alert(&handles, "h1").await;

        let (status, _) = send(&app, Method::POST, "/api/alerts/resolve-all", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            send(&app, Method::POST, "/api/alerts/resolve-all", Some("tok-bob"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(handles.alerts.count_open().await.unwrap(), 1);

        let (status, body) =
            send(&app, Method::POST, "/api/alerts/resolve-all", Some("tok-alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(handles.alerts.count_open().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolve_one_status_codes() {
        let (app, handles) = create_test_router(CONFIG).await;
        let event = open_alert(&handles, "h1").await;
        let uri = format!("/api/alerts/events/{}/resolve", event.id);

        let (status, body) = send(
            &app,
            Method::POST,
            &uri,
            Some("tok-alice"),
            Some(json!({ "notes": "fan replaced" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event"]["resolved_by"], "alice");
        assert_eq!(body["event"]["notes"], "fan replaced");

        let (status, _) = send(&app, Method::POST, &uri, Some("tok-alice"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/alerts/events/999/resolve",
            Some("tok-alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_condition_management() {
        let (app, _) = create_test_router(CONFIG).await;
        let condition = json!({
            "name": "hot-cpu",
            "source": "sensor",
            "field_name": "cpu_temp",
            "comparator": ">",
            "threshold": 90,
        });

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/alerts/conditions",
            None,
            Some(condition.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/alerts/conditions",
            Some("tok-alice"),
            Some(condition.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["condition"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/alerts/conditions",
            Some("tok-alice"),
            Some(condition),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/alerts/conditions",
            Some("tok-alice"),
            Some(json!({
                "name": "bad-field",
                "source": "disk",
                "field_name": "temperature",
                "comparator": ">",
                "threshold": 1,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/api/alerts/conditions/{id}/enabled"),
            Some("tok-alice"),
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["condition"]["enabled"], false);

        let (status, body) = send(&app, Method::GET, "/api/alerts/conditions", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conditions"].as_array().unwrap().len(), 1);

        let (_, body) = send(&app, Method::GET, "/api/events?kind=audit", None, None).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_events_rejects_bad_filters() {
        let (app, _) = create_test_router(CONFIG).await;
        let (status, _) = send(&app, Method::GET, "/api/events?kind=weird", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, Method::GET, "/api/events?range=2y", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(
            &app,
            Method::GET,
            "/api/events?order=asc&range=24h&limit=5",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stream_requires_channel() {
        let (app, _) = create_test_router(CONFIG).await;
        let (status, body) = send(&app, Method::GET, "/api/stream", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "channel is required");
    }
}
