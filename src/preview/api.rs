use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::compute::{ComputePlatform, SecretChanges};
use super::db::DbHandle;
use super::local::LocalPreviewManager;
use super::models::{DeploymentKind, TeamMember};
use super::pipeline::{DeployOutcome, PipelineExecutor};
use super::promotion::PromotionController;
use super::proxy::PreviewProxy;
use super::screenshot::SCREENSHOT_ROUTE;
use super::workspace::{WorkspaceStore, validate_generation_id};
use crate::errors::OrchestratorError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub workspaces: WorkspaceStore,
    pub executor: PipelineExecutor,
    pub promotion: PromotionController,
    pub compute: Arc<dyn ComputePlatform>,
    pub screenshots_dir: PathBuf,
    /// Present only in local interactive preview mode.
    pub local: Option<Arc<LocalPreviewManager>>,
    pub proxy: Option<PreviewProxy>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub generation_id: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployRequest {
    pub template_name: String,
    pub instance_name: String,
}

#[derive(Deserialize)]
pub struct PromoteRequest {
    #[serde(default)]
    pub team: Vec<TeamMember>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPreviewRequest {
    pub generation_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let msg = err.to_string();
        match err {
            OrchestratorError::GenerationNotFound { .. } | OrchestratorError::PreviewNotReady => {
                ApiError::NotFound(msg)
            }
            OrchestratorError::InvalidGenerationId { .. } => ApiError::BadRequest(msg),
            OrchestratorError::NoPreview { .. }
            | OrchestratorError::WorkspaceInUse { .. }
            | OrchestratorError::SourceUnavailable { .. } => ApiError::Conflict(msg),
            OrchestratorError::UpstreamUnreachable(_)
            | OrchestratorError::ComputeApi(_)
            | OrchestratorError::ProvisionFailed { .. }
            | OrchestratorError::DeployFailed { .. }
            | OrchestratorError::DeployTimeout { .. }
            | OrchestratorError::ArchiveFailed { .. }
            | OrchestratorError::PreviewStartFailed { .. } => ApiError::BadGateway(msg),
            _ => {
                error!(error = %msg, "Request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// Control routes. Local preview routes are mounted only in local mode; the
/// fallback proxies everything else to the local preview, or answers 404.
pub fn api_router(local_mode: bool) -> Router<SharedState> {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/api/deployments", post(create_deployment))
        .route("/api/redeploy", post(redeploy))
        .route("/api/generations/{id}", get(get_generation))
        .route("/api/generations/{id}/workspace", delete(delete_workspace))
        .route("/api/generations/{id}/promote", post(promote_generation))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{name}", delete(destroy_instance))
        .route("/api/instances/{name}/secrets", post(set_instance_secrets))
        .route(&format!("{}/{{file}}", SCREENSHOT_ROUTE), get(serve_screenshot));

    let router = if local_mode {
        router.route(
            "/api/local-preview",
            get(local_preview_status)
                .post(start_local_preview)
                .delete(stop_local_preview),
        )
    } else {
        router
    };

    router.fallback(proxy_fallback)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_deployment(
    State(state): State<SharedState>,
    Json(req): Json<DeployRequest>,
) -> Result<Response, ApiError> {
    let kind = match req.kind.as_deref() {
        Some(kind) => DeploymentKind::from_str(kind).map_err(ApiError::BadRequest)?,
        None => DeploymentKind::Draft,
    };
    let id = req.generation_id;

    let response = match state.executor.start_deploy(&id, kind).await? {
        DeployOutcome::Accepted(_) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "generationId": id})),
        ),
        DeployOutcome::InProgress => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "in_progress", "generationId": id})),
        ),
        DeployOutcome::AlreadyDeployed { preview_url } => (
            StatusCode::OK,
            Json(json!({
                "status": "already_deployed",
                "generationId": id,
                "previewUrl": preview_url,
            })),
        ),
    };
    Ok(response.into_response())
}

async fn redeploy(
    State(state): State<SharedState>,
    Json(req): Json<RedeployRequest>,
) -> Result<Response, ApiError> {
    if !state.workspaces.template_exists(&req.template_name) {
        return Err(ApiError::BadRequest(format!(
            "Unknown template '{}'",
            req.template_name
        )));
    }
    let status = match state
        .executor
        .start_redeploy(&req.template_name, &req.instance_name)?
    {
        DeployOutcome::InProgress => "in_progress",
        _ => "accepted",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": status, "instanceName": req.instance_name})),
    )
        .into_response())
}

async fn get_generation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let record = state
        .db
        .call(move |db| db.get_generation(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Generation {} not found", id)))?;
    Ok(Json(record))
}

/// Post-publish cleanup. Refused while the generation is still in flight.
async fn delete_workspace(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_generation_id(&id)?;
    let lookup = id.clone();
    let record = state
        .db
        .call(move |db| db.get_generation(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Generation {} not found", id)))?;

    if !record.status.is_terminal() || state.executor.is_running(&id) {
        return Err(OrchestratorError::WorkspaceInUse {
            generation_id: id,
            status: record.status.to_string(),
        }
        .into());
    }

    let deleted = state.workspaces.delete(&id).await?;
    let clear = id.clone();
    state
        .db
        .call(move |db| db.clear_workspace_path(&clear))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!(generation_id = %id, deleted, "[{}] Workspace cleanup requested", id);
    Ok(Json(json!({"deleted": deleted})))
}

async fn promote_generation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PromoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let promotion = state.promotion.promote(&id, &req.team).await?;
    Ok(Json(json!({
        "status": "promoted",
        "generationId": promotion.generation_id,
        "instanceName": promotion.instance_name,
        "url": promotion.url,
        "productionDeploymentId": promotion.production_deployment_id,
    })))
}

async fn list_instances(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let instances = state.compute.list_instances().await?;
    Ok(Json(instances))
}

async fn destroy_instance(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.compute.destroy(&name).await?;
    info!(instance = %name, "Instance destroyed on request");
    Ok(StatusCode::NO_CONTENT)
}

async fn set_instance_secrets(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(changes): Json<SecretChanges>,
) -> Result<impl IntoResponse, ApiError> {
    state.promotion.set_secrets(&name, &changes).await?;
    Ok(Json(json!({"status": "applied"})))
}

async fn serve_screenshot(
    State(state): State<SharedState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Reject path traversal
    if file.contains("..") || file.contains('/') || file.contains('\\') {
        return Err(ApiError::BadRequest("Invalid path".into()));
    }

    let full_path = state.screenshots_dir.join(&file);
    if !full_path.is_file() {
        return Err(ApiError::NotFound(format!("Screenshot not found: {}", file)));
    }

    let content_type = match full_path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };

    let bytes = tokio::fs::read(&full_path)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read screenshot: {}", e)))?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type)], bytes))
}

// ── Local preview ─────────────────────────────────────────────────────

fn local_manager(state: &SharedState) -> Result<&Arc<LocalPreviewManager>, ApiError> {
    state
        .local
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("Local preview mode is disabled".into()))
}

/// Blocks until the preview is ready or its start timeout elapses.
async fn start_local_preview(
    State(state): State<SharedState>,
    Json(req): Json<LocalPreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let local = local_manager(&state)?;
    let id = req.generation_id;
    validate_generation_id(&id)?;

    let lookup = id.clone();
    let record = state
        .db
        .call(move |db| db.get_generation(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Generation {} not found", id)))?;

    let workspace = state
        .workspaces
        .materialize(
            &id,
            record.archive_url.as_deref(),
            record.workspace_path.as_deref().map(std::path::Path::new),
        )
        .await?;
    let path = workspace.display().to_string();
    if record.workspace_path.as_deref() != Some(path.as_str()) {
        let persist = id.clone();
        state
            .db
            .call(move |db| db.set_workspace_path(&persist, &path))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    let preview = local.start(&id, &workspace).await?;
    Ok(Json(preview))
}

async fn local_preview_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let local = local_manager(&state)?;
    Ok(Json(json!({"preview": local.status()})))
}

async fn stop_local_preview(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let local = local_manager(&state)?;
    let stopped = local.stop().await;
    Ok(Json(json!({"stopped": stopped})))
}

/// Every unmatched request. Proxied in local mode, 404 otherwise.
async fn proxy_fallback(State(state): State<SharedState>, req: Request) -> Response {
    let Some(proxy) = &state.proxy else {
        return ApiError::NotFound(format!("No route for {}", req.uri().path())).into_response();
    };
    match proxy.forward(req).await {
        Ok(resp) => resp,
        Err(e) => ApiError::from(e).into_response(),
    }
}
