//! HTTP API handlers and routing.

pub mod apps;
pub mod error;
mod gpus;
mod health;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::manager::AppManager;

/// Create the agent API router.
pub fn create_router(manager: Arc<AppManager>) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(gpus::routes())
        .nest("/apps", apps::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}
