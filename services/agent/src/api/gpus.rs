//! GPU snapshot endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::manager::AppManager;
use crate::resources::GpuSnapshot;

pub fn routes() -> Router<Arc<AppManager>> {
    Router::new().route("/gpus", get(get_gpus))
}

/// Last observed GPU state with agent-side reservations.
///
/// GET /gpus
async fn get_gpus(State(manager): State<Arc<AppManager>>) -> Json<GpuSnapshot> {
    Json(manager.gpu_snapshot().await)
}
