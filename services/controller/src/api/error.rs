use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{PlatformError, ProvisionError};

/// Seconds a caller should wait after a capacity-exhausted answer.
const CAPACITY_RETRY_AFTER_SECONDS: u32 = 5;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://podpool.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
            retry_after_seconds: 0,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::BAD_GATEWAY, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn too_many_requests(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::TOO_MANY_REQUESTS, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.retry_after_seconds = seconds;
        if seconds > 0 {
            self.problem.retryable = true;
        }
        self
    }
}

impl From<ProvisionError> for ApiError {
    fn from(error: ProvisionError) -> Self {
        match &error {
            ProvisionError::CapacityExhausted { .. } => {
                ApiError::too_many_requests("capacity_exhausted", error.to_string())
                    .with_retry_after_seconds(CAPACITY_RETRY_AFTER_SECONDS)
            }
            ProvisionError::UnknownInstance(_) => {
                ApiError::not_found("instance_not_found", error.to_string())
            }
            ProvisionError::Platform(PlatformError::InvalidShape(_)) => {
                ApiError::bad_request("invalid_shape", error.to_string())
            }
            ProvisionError::Platform(_) => ApiError::bad_gateway("platform_failure", error.to_string()),
            ProvisionError::InvalidId(_) => ApiError::internal("invalid_instance_id", error.to_string()),
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
