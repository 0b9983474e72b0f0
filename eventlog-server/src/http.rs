use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use eventlog_core::{
    Cluster, EventLogError, EventLogLine, Instance, PipelineMetrics, read_event_log,
    tail_docker_log,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const DEFAULT_LEVEL: &str = "info";
const DEFAULT_TAIL_LINES: usize = 100;
const MAX_TAIL_LINES: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub metrics: PipelineMetrics,
}

impl AppState {
    fn home_path(&self) -> PathBuf {
        self.cluster.config().store.db.home_path.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/event_log/:event_id", get(event_log))
        .route("/docker_log/:service_id", get(docker_log))
        .route("/docker_instance", get(docker_instance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(EventLogError);

impl From<EventLogError> for ApiError {
    fn from(error: EventLogError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EventLogError::InvalidMessage(_) | EventLogError::UnknownKind(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instance_id: String,
    members: usize,
    peers: Vec<String>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cluster = &state.cluster;
    Json(HealthResponse {
        status: "ok",
        instance_id: cluster.instance_id(),
        members: cluster.discovery().others().len() + 1,
        peers: cluster.sub_manager().peers(),
    })
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.metrics.registry().gather(), &mut buffer)
        .map_err(EventLogError::from)?;
    Ok((
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}

#[derive(Deserialize)]
struct LevelQuery {
    level: Option<String>,
}

#[derive(Serialize)]
struct EventLogResponse {
    event_id: String,
    lines: Vec<EventLogLine>,
}

async fn event_log(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Query(query): Query<LevelQuery>,
) -> Result<Json<EventLogResponse>, ApiError> {
    let level = query.level.unwrap_or_else(|| DEFAULT_LEVEL.to_string());
    let base = state.home_path().join("eventlog");
    let lines = read_event_log(&base, &event_id, &level).await?;
    Ok(Json(EventLogResponse { event_id, lines }))
}

#[derive(Deserialize)]
struct TailQuery {
    lines: Option<usize>,
}

#[derive(Serialize)]
struct DockerLogResponse {
    service_id: String,
    lines: Vec<String>,
}

async fn docker_log(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<DockerLogResponse>, ApiError> {
    let count = query
        .lines
        .unwrap_or(DEFAULT_TAIL_LINES)
        .clamp(1, MAX_TAIL_LINES);
    let lines = tail_docker_log(&state.home_path(), &service_id, count).await?;
    Ok(Json(DockerLogResponse { service_id, lines }))
}

#[derive(Deserialize)]
struct OwnerQuery {
    service_id: String,
}

#[derive(Serialize)]
struct OwnerResponse {
    service_id: String,
    instance_id: String,
    instance: Option<Instance>,
}

async fn docker_instance(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<OwnerResponse>, ApiError> {
    if query.service_id.trim().is_empty() {
        return Err(EventLogError::InvalidMessage("service_id cannot be empty".to_string()).into());
    }
    let (instance_id, instance) = state.cluster.owner_of(&query.service_id).await?;
    Ok(Json(OwnerResponse {
        service_id: query.service_id,
        instance_id,
        instance,
    }))
}
