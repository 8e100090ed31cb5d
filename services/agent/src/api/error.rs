use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::LaunchError;
use crate::resources::AllocError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://hostdeck.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    /// Capacity is short right now; the same request may succeed later.
    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.retryable = true;
        err
    }
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        let detail = err.to_string();
        match err {
            LaunchError::Allocation(AllocError::ResourceExhausted { .. }) => {
                Self::unavailable("resource_exhausted", detail)
            }
            LaunchError::Allocation(AllocError::InsufficientCapacity { .. }) => {
                Self::unavailable("insufficient_capacity", detail)
            }
            LaunchError::Allocation(AllocError::PortConflict { .. }) => {
                Self::conflict("port_conflict", detail)
            }
            LaunchError::Allocation(AllocError::Poisoned) => Self::internal("internal", detail),
            LaunchError::BuildFailed { .. } => Self::internal("build_failed", detail),
            LaunchError::LaunchFailed { .. } => Self::internal("launch_failed", detail),
            LaunchError::NotRestartable(_) => Self::conflict("not_restartable", detail),
            LaunchError::InvalidState { .. } => Self::conflict("invalid_state", detail),
            LaunchError::NotFound(_) => Self::not_found("app_not_found", detail),
            LaunchError::InvalidRequest(_) => Self::bad_request("invalid_request", detail),
            LaunchError::Proxy(_) => Self::internal("proxy_error", detail),
            LaunchError::Store(_) => Self::internal("store_error", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppStatus;
    use hostdeck_id::AppId;
    use rstest::rstest;

    #[rstest]
    #[case(LaunchError::Allocation(AllocError::ResourceExhausted { candidates: 2 }), 503, "resource_exhausted")]
    #[case(LaunchError::Allocation(AllocError::InsufficientCapacity { required_mb: 9000, available_mb: 7000 }), 503, "insufficient_capacity")]
    #[case(LaunchError::NotRestartable(AppId::new()), 409, "not_restartable")]
    #[case(LaunchError::InvalidState { app_id: AppId::new(), status: AppStatus::Running, operation: "restart" }, 409, "invalid_state")]
    #[case(LaunchError::NotFound(AppId::new()), 404, "app_not_found")]
    #[case(LaunchError::InvalidRequest("bad".into()), 400, "invalid_request")]
    #[case(LaunchError::launch(AppId::new(), "boom"), 500, "launch_failed")]
    fn test_error_mapping(#[case] err: LaunchError, #[case] status: u16, #[case] code: &str) {
        let api: ApiError = err.into();
        assert_eq!(api.status.as_u16(), status);
        assert_eq!(api.problem.code, code);
        assert_eq!(api.problem.retryable, status == 503);
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::not_found("app_not_found", "nope").into_response();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
