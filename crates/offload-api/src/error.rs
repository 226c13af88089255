//! Error responses for the HTTP layer.
//!
//! Every non-success response carries the same body:
//!
//! ```json
//! { "error": { "code": "BACKPRESSURE", "message": "task queue is full, retry after 5s" } }
//! ```
//!
//! Retryable rejections also set `Retry-After`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use offload_pipeline::PipelineError;
use serde::Serialize;
use tracing::error;

/// Retry hint for requests refused because the service is stopping.
pub const SHUTTING_DOWN_RETRY_AFTER_SECONDS: u64 = 30;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// An error ready to be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    /// Creates an error response.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), retry_after_seconds: None }
    }

    /// 422 for malformed or out-of-range request data.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    /// 404 for a missing resource.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Adds a `Retry-After` hint.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::SsrfRejected(_) => StatusCode::BAD_REQUEST,
            PipelineError::Backpressure { .. } | PipelineError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::WorkFailure { .. }
            | PipelineError::ShutdownTimeout { .. }
            | PipelineError::Configuration(_)
            | PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &err {
            PipelineError::Storage(e) => {
                error!(error = %e, "storage failure while handling request");
                "storage unavailable".to_string()
            },
            other => other.to_string(),
        };

        let retry_after = match &err {
            PipelineError::ShuttingDown => Some(SHUTTING_DOWN_RETRY_AFTER_SECONDS),
            other => other.retry_after_seconds(),
        };

        Self { status, code: err.code(), message, retry_after_seconds: retry_after }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail { code: self.code.to_string(), message: self.message },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after_seconds {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
