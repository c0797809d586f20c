use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::errors::{ServerError, ServerResult};
use crate::ledger::{CommandEnvelope, CommandLedger, CommandStatus, HostGauges};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<CommandLedger>,
    pub config: Arc<ServerConfig>,
    /// SHA-256 of the served agent artifact, computed once at startup.
    pub artifact_sha256: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/metrics", post(push_status))
        .route("/api/vms", get(list_vms))
        .route("/api/vms/{hostname}", get(get_vm))
        .route("/api/vms/{hostname}/command", post(queue_command))
        .route("/api/commands/{id}", get(command_status))
        .route("/api/commands/{id}/result", post(command_result))
        .route("/api/agent/version", get(agent_version))
        .route("/api/agent/download", get(agent_download))
        .route("/api/agent/requirements", get(agent_requirements))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn require_api_key(headers: &HeaderMap, state: &AppState) -> ServerResult<()> {
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != state.config.http.api_key {
        return Err(ServerError::Unauthorized);
    }
    Ok(())
}

/// Status push from an agent: the request body carries the host's gauges, and
/// the response carries every command currently pending for that host.
/// Producing the response is the same transaction that marks each command
/// `sent`, so delivery is at-most-once by construction.
#[derive(Debug, Deserialize)]
struct StatusPush {
    hostname: String,
    #[serde(flatten)]
    gauges: HostGauges,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    status: &'static str,
    hostname: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    commands: Vec<CommandEnvelope>,
}

async fn push_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(push): Json<StatusPush>,
) -> ServerResult<Json<PollResponse>> {
    require_api_key(&headers, &state)?;
    state.ledger.observe_host(&push.hostname, &push.gauges)?;
    let commands = state.ledger.pop_pending(&push.hostname)?;
    Ok(Json(PollResponse {
        status: "ok",
        hostname: push.hostname,
        commands,
    }))
}

async fn list_vms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    Ok(Json(state.ledger.list_hosts()?))
}

async fn get_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hostname): Path<String>,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    let host = state
        .ledger
        .get_host(&hostname)?
        .ok_or_else(|| ServerError::NotFound(format!("host '{}'", hostname)))?;
    Ok(Json(host))
}

#[derive(Debug, Deserialize)]
struct QueueRequest {
    // Defaulted so an absent key reaches the handler's own 400, not a 422
    // from deserialization.
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: String,
}

async fn queue_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hostname): Path<String>,
    Json(req): Json<QueueRequest>,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    if req.command.is_empty() {
        return Err(ServerError::InvalidRequest("Missing command".to_string()));
    }
    let id = state.ledger.enqueue(&hostname, &req.command, &req.args)?;
    info!("Queued command '{}' (id {}) for {}", req.command, id, hostname);
    Ok(Json(json!({ "status": "queued", "id": id })))
}

#[derive(Debug, Deserialize)]
struct ResultReport {
    status: CommandStatus,
    #[serde(default)]
    output: String,
}

async fn command_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(report): Json<ResultReport>,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    state
        .ledger
        .record_result(id, report.status, &report.output)?;
    Ok(Json(json!({ "status": "success" })))
}

async fn command_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    let record = state
        .ledger
        .get_status(id)?
        .ok_or_else(|| ServerError::NotFound(format!("command {}", id)))?;
    Ok(Json(record))
}

async fn agent_version(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    let dist = &state.config.agent_dist;
    let version = dist
        .version
        .clone()
        .ok_or_else(|| ServerError::NotFound("no agent build configured".to_string()))?;
    Ok(Json(json!({
        "version": version,
        "download_url": "/api/agent/download",
        "requirements_url": dist.requirements_path.as_ref().map(|_| "/api/agent/requirements"),
        "sha256": state.artifact_sha256,
    })))
}

async fn agent_download(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    serve_artifact(state.config.agent_dist.artifact_path.as_deref()).await
}

async fn agent_requirements(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse> {
    require_api_key(&headers, &state)?;
    serve_artifact(state.config.agent_dist.requirements_path.as_deref()).await
}

async fn serve_artifact(path: Option<&std::path::Path>) -> ServerResult<impl IntoResponse> {
    let path = path.ok_or_else(|| ServerError::NotFound("artifact not configured".to_string()))?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ServerError::NotFound(format!("artifact unavailable: {}", e)))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}
