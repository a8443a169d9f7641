//! HTTP API for event submission, chain and model queries, health checks and
//! Prometheus metrics

use chainwatch_lib::{
    classifier::FeedbackAck,
    correlation::AttackChain,
    health::ComponentStatus,
    predictor::{ModelMetrics, ModelSource, ModelSummary},
    CoreError, SecurityEvent, SubmissionResult, ThreatService,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ThreatService>,
}

impl AppState {
    pub fn new(service: Arc<ThreatService>) -> Self {
        Self { service }
    }
}

/// A [`CoreError`] rendered as a JSON error body
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::ModelNotFound(_)
            | CoreError::UnknownEvent(_)
            | CoreError::ChainNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InsufficientSignal { .. } | CoreError::ModelLoad { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            e if e.is_recoverable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub event_id: String,
    pub label: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChainQuery {
    pub actor: Option<String>,
    pub asset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub false_positive: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    /// Replacement source; the model's current source when absent
    #[serde(default)]
    pub source: Option<ModelSource>,
}

async fn submit_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<SecurityEvent>,
) -> ApiResult<SubmissionResult> {
    Ok(Json(state.service.submit_event(event).await?))
}

async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackAck>), ApiError> {
    let ack = state
        .service
        .submit_feedback(&request.event_id, &request.label)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn list_chains(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChainQuery>,
) -> Json<Vec<AttackChain>> {
    Json(
        state
            .service
            .get_open_chains(query.actor.as_deref(), query.asset.as_deref()),
    )
}

async fn get_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AttackChain> {
    Ok(Json(state.service.get_chain(&id)?))
}

async fn resolve_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<AttackChain> {
    Ok(Json(
        state
            .service
            .resolve_chain(&id, request.false_positive)
            .await?,
    ))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelSummary>> {
    Json(state.service.list_models())
}

async fn model_metrics(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<ModelMetrics> {
    Ok(Json(state.service.model_metrics(&name)?))
}

async fn reload_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<ReloadRequest>,
) -> ApiResult<ModelSummary> {
    state.service.reload_model(&name, request.source).await?;
    let summary = state
        .service
        .list_models()
        .into_iter()
        .find(|m| m.name == name)
        .ok_or(CoreError::ModelNotFound(name))?;
    Ok(Json(summary))
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.service.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.service.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/events", post(submit_event))
        .route("/api/v1/feedback", post(submit_feedback))
        .route("/api/v1/chains", get(list_chains))
        .route("/api/v1/chains/:id", get(get_chain))
        .route("/api/v1/chains/:id/resolve", post(resolve_chain))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/:name/metrics", get(model_metrics))
        .route("/api/v1/models/:name/reload", post(reload_model))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server, stopping once `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
