//! HTTP surface of the controller. Thin handlers over the engine; all
//! validation and sequencing lives in `fedmesh-core`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fedmesh_core::{
    ArtifactStore, ClientId, ClientRegistry, ModelVersionId, Reducer, RejectReason, RoundId, SessionConfig, SessionError,
    SessionId, ValidationLedger,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::channel::TaskQueueChannel;

#[derive(Clone)]
pub struct AppState {
    pub reducer: Reducer,
    pub registry: Arc<ClientRegistry>,
    pub ledger: Arc<ValidationLedger>,
    pub tasks: Arc<TaskQueueChannel>,
    pub store: Arc<dyn ArtifactStore>,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::UnknownSession(_) => ApiError(StatusCode::NOT_FOUND, e.to_string()),
            SessionError::Config(_) => ApiError(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", post(start_session))
        .route("/sessions/:id", get(session_status))
        .route("/sessions/:id/models", get(session_models))
        .route("/sessions/:id/abort", post(abort_session))
        .route("/updates", post(submit_update))
        .route("/validations", post(record_validation))
        .route("/validations/:model_id", get(query_validations))
        .route("/clients/:id/heartbeat", post(heartbeat))
        .route("/clients/:id/tasks", get(poll_tasks))
        .route("/artifacts", post(put_artifact))
        .route("/artifacts/:id", get(get_artifact))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Json<fedmesh_core::MetricsSnapshot> {
    Json(state.reducer.metrics())
}

async fn start_session(
    State(state): State<AppState>,
    Json(config): Json<SessionConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = state.reducer.start_session(config)?;
    Ok(Json(json!({ "session_id": session_id })))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.reducer.status(&id)?;
    Ok(Json(json!({ "session_id": id, "state": status })))
}

async fn session_models(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Vec<fedmesh_core::ModelVersion>>, ApiError> {
    Ok(Json(state.reducer.model_trail(&id)?))
}

async fn abort_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> Result<StatusCode, ApiError> {
    state.reducer.abort(&id)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    round_id: RoundId,
    client_id: ClientId,
    delta: Uuid,
    sample_count: u64,
}

#[derive(Debug, Serialize)]
struct UpdateResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
}

/// A reject is a normal protocol outcome, not a transport failure, so it
/// still answers 200 with the reason spelled out.
async fn submit_update(State(state): State<AppState>, Json(req): Json<UpdateRequest>) -> Json<UpdateResponse> {
    match state
        .reducer
        .submit_update(req.round_id, req.client_id, req.delta, req.sample_count)
    {
        Ok(()) => Json(UpdateResponse {
            accepted: true,
            reason: None,
        }),
        Err(reason) => Json(UpdateResponse {
            accepted: false,
            reason: Some(reason),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ValidationRequest {
    model_version_id: ModelVersionId,
    client_id: ClientId,
    metrics: HashMap<String, f64>,
}

async fn record_validation(
    State(state): State<AppState>,
    Json(req): Json<ValidationRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.registry.heartbeat(&req.client_id);
    state.ledger.record(req.model_version_id, req.client_id, req.metrics);
    (StatusCode::CREATED, Json(json!({ "accepted": true })))
}

async fn query_validations(
    State(state): State<AppState>,
    Path(model_id): Path<ModelVersionId>,
) -> Json<Vec<fedmesh_core::ValidationRecord>> {
    Json(state.ledger.query(&model_id))
}

async fn heartbeat(State(state): State<AppState>, Path(id): Path<ClientId>) -> StatusCode {
    state.registry.heartbeat(&id);
    StatusCode::OK
}

async fn poll_tasks(State(state): State<AppState>, Path(id): Path<ClientId>) -> Json<Vec<fedmesh_core::RoundTask>> {
    state.registry.heartbeat(&id);
    Json(state.tasks.drain(&id))
}

#[derive(Debug, Deserialize)]
struct ArtifactRequest {
    params: Vec<f32>,
}

async fn put_artifact(State(state): State<AppState>, Json(req): Json<ArtifactRequest>) -> Json<serde_json::Value> {
    let id = state.store.put(req.params);
    Json(json!({ "artifact_id": id }))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let params = state
        .store
        .get(&id)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("unknown artifact {id}")))?;
    Ok(Json(json!({ "artifact_id": id, "params": params })))
}
