//! Errors surfaced by app operations.

use hostdeck_id::AppId;
use thiserror::Error;

use crate::app::AppStatus;
use crate::proxy::ProxyError;
use crate::resources::AllocError;
use crate::state::StateStoreError;

/// Failure of a deploy, stop, restart or delete.
///
/// Allocation and launch failures leave no resources committed: anything
/// already acquired is released before the error is returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Allocation(#[from] AllocError),

    /// A build step exited unsuccessfully. The output is also in the app log.
    #[error("build failed for {app_id} at `{step}`: {output}")]
    BuildFailed {
        app_id: AppId,
        step: String,
        output: String,
    },

    #[error("launch failed for {app_id}: {reason}")]
    LaunchFailed { app_id: AppId, reason: String },

    #[error("app {0} has no retained artifact to restart from")]
    NotRestartable(AppId),

    #[error("cannot {operation} app {app_id} while it is {status}")]
    InvalidState {
        app_id: AppId,
        status: AppStatus,
        operation: &'static str,
    },

    #[error("app {0} not found")]
    NotFound(AppId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
}

impl LaunchError {
    pub(crate) fn launch(app_id: AppId, reason: impl std::fmt::Display) -> Self {
        Self::LaunchFailed {
            app_id,
            reason: reason.to_string(),
        }
    }
}
