//! App endpoints.
//!
//! Thin wrappers over [`AppManager`]; every lifecycle rule lives there.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hostdeck_id::AppId;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::app::{App, AppStatus, Variant};
use crate::manager::{AppManager, DeployRequest, Outcome};

pub fn routes() -> Router<Arc<AppManager>> {
    Router::new()
        .route("/", post(deploy_app).get(list_apps))
        .route("/{app_id}", get(get_app).delete(delete_app))
        .route("/{app_id}/stop", post(stop_app))
        .route("/{app_id}/restart", post(restart_app))
        .route("/{app_id}/logs", get(get_logs))
}

// =============================================================================
// Response Types
// =============================================================================

/// Public view of an app. Runtime handles and artifacts stay internal.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppView {
    pub app_id: AppId,
    pub variant: Variant,
    pub status: AppStatus,
    pub url: String,
    pub port: Option<u16>,
    pub gpus: Vec<u32>,
    pub vram_required_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl AppView {
    fn new(app: &App, warnings: Vec<String>) -> Self {
        Self {
            app_id: app.id,
            variant: app.variant,
            status: app.status,
            url: app.url(),
            port: app.port,
            gpus: app.gpu_indices(),
            vram_required_mb: app.vram_required_mb,
            error: app.error.clone(),
            warnings,
        }
    }
}

impl From<Outcome> for AppView {
    fn from(outcome: Outcome) -> Self {
        Self::new(&outcome.app, outcome.warnings)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListAppsResponse {
    pub items: Vec<AppView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /apps
async fn deploy_app(
    State(manager): State<Arc<AppManager>>,
    Json(req): Json<DeployRequest>,
) -> Result<Response, ApiError> {
    let outcome = manager.deploy(req).await?;
    Ok((StatusCode::CREATED, Json(AppView::from(outcome))).into_response())
}

/// GET /apps
async fn list_apps(State(manager): State<Arc<AppManager>>) -> Json<ListAppsResponse> {
    let items = manager
        .list()
        .await
        .iter()
        .map(|app| AppView::new(app, Vec::new()))
        .collect();
    Json(ListAppsResponse { items })
}

/// GET /apps/{app_id}
async fn get_app(
    State(manager): State<Arc<AppManager>>,
    Path(app_id): Path<String>,
) -> Result<Json<AppView>, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    let app = manager
        .get(app_id)
        .await
        .ok_or_else(|| ApiError::not_found("app_not_found", format!("app {app_id} not found")))?;
    Ok(Json(AppView::new(&app, Vec::new())))
}

/// POST /apps/{app_id}/stop
async fn stop_app(
    State(manager): State<Arc<AppManager>>,
    Path(app_id): Path<String>,
) -> Result<Json<AppView>, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    Ok(Json(manager.stop(app_id).await?.into()))
}

/// POST /apps/{app_id}/restart
async fn restart_app(
    State(manager): State<Arc<AppManager>>,
    Path(app_id): Path<String>,
) -> Result<Json<AppView>, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    Ok(Json(manager.restart(app_id).await?.into()))
}

/// DELETE /apps/{app_id}
async fn delete_app(
    State(manager): State<Arc<AppManager>>,
    Path(app_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    let warnings = manager.delete(app_id).await?;
    Ok(Json(DeleteResponse { ok: true, warnings }))
}

/// GET /apps/{app_id}/logs
async fn get_logs(
    State(manager): State<Arc<AppManager>>,
    Path(app_id): Path<String>,
) -> Result<Response, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    let log = manager.read_log(app_id).await?;
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], log).into_response())
}

fn parse_app_id(raw: &str) -> Result<AppId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid_app_id", "Invalid app ID format"))
}
