//! HTTP control plane for guided.
//!
//! Thin JSON layer over `RunService`. Bound to localhost; an optional bearer
//! token guards every route except `/health`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use guide_core::{Id, RunTimelineEvent, WorkflowRun, WorkflowTemplate};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::metrics::RunMetrics;
use crate::service::{CreateRunRequest, DecisionRequest, RunListFilter, RunService, ServiceError};
use crate::turns::TurnSignal;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub service: RunService,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/templates", get(list_templates))
        .route("/metrics", get(get_metrics))
        .route("/metrics/reset", post(reset_metrics))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/timeline", get(get_timeline))
        .route("/runs/{id}/start", post(start_run))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/resume-failed", post(resume_failed_run))
        .route("/runs/{id}/advance", post(advance_run))
        .route("/runs/{id}/dismiss", post(dismiss_run))
        .route("/runs/{id}/decisions", post(handle_decision))
        .route("/turns", post(turn_completed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until the listener fails.
pub async fn start_server(
    service: RunService,
    port: u16,
    auth_token: Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState {
        service,
        auth_token,
    });
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(error_body(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(error_body(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map a service error to its status code.
fn service_error(err: ServiceError) -> ApiError {
    let status = match &err {
        ServiceError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::MissingContext(_) | ServiceError::Policy(_) | ServiceError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::TemplateNotFound(_) | ServiceError::RunNotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ServiceError::RunLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::Execution(_)
        | ServiceError::StepDispatchUnavailable(_)
        | ServiceError::StepDispatchDeferred(_)
        | ServiceError::StepDispatchFatal(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, status = status.as_u16(), "request rejected");
    }
    error_body(status, err.to_string())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: WorkflowRun,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<WorkflowRun>,
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub events: Vec<RunTimelineEvent>,
}

#[derive(Debug, Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<WorkflowTemplate>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: RunMetrics,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetMetricsQuery {
    #[serde(default)]
    pub force: bool,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /templates
async fn list_templates(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TemplatesResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let templates = state.service.list_templates().await.map_err(service_error)?;
    Ok(Json(TemplatesResponse { templates }))
}

/// GET /metrics
async fn get_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MetricsResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let metrics = state.service.metrics().await;
    Ok(Json(MetricsResponse { metrics }))
}

/// POST /metrics/reset?force=
async fn reset_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ResetMetricsQuery>,
) -> Result<Json<MetricsResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let metrics = state.service.reset_metrics(query.force).await;
    Ok(Json(MetricsResponse { metrics }))
}

/// POST /runs
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let run = state.service.create_run(req).await.map_err(service_error)?;
    Ok((StatusCode::CREATED, Json(RunResponse { run })))
}

/// GET /runs?workspace_id=&include_dismissed=
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<RunListFilter>,
) -> Result<Json<ListRunsResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let runs = state.service.list_runs(&filter).await;
    Ok(Json(ListRunsResponse { runs }))
}

/// GET /runs/{id}
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .get_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// GET /runs/{id}/timeline
async fn get_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TimelineResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let events = state
        .service
        .get_run_timeline(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(TimelineResponse { events }))
}

/// POST /runs/{id}/start
async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .start_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/pause
async fn pause_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .pause_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/resume
async fn resume_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .resume_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/resume-failed
async fn resume_failed_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .resume_failed_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/advance
async fn advance_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .advance_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/dismiss
async fn dismiss_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .dismiss_run(&Id::from_string(id))
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/decisions
async fn handle_decision(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let run = state
        .service
        .handle_decision(&Id::from_string(id), req)
        .await
        .map_err(service_error)?;
    Ok(Json(RunResponse { run }))
}

/// POST /turns
async fn turn_completed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(signal): Json<TurnSignal>,
) -> Result<Json<ListRunsResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let runs = state
        .service
        .on_turn_completed(&signal)
        .await
        .map_err(service_error)?;
    Ok(Json(ListRunsResponse { runs }))
}
