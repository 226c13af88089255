//! Error types for the request-processing pipeline.

use std::time::Duration;

use offload_core::{CoreError, TaskId};
use offload_delivery::UnsafeReason;
use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced to callers of the pipeline.
///
/// Admission errors (`Validation`, `SsrfRejected`, `Backpressure`,
/// `RateLimited`, `ShuttingDown`) leave nothing persisted. Work and delivery
/// failures of accepted tasks are recorded on the task instead of being
/// returned; `WorkFailure` only reaches callers of the inline path.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Request parameters out of bounds.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Callback URL failed safety validation.
    #[error("callback URL rejected ({code}): {0}", code = .0.code())]
    SsrfRejected(UnsafeReason),

    /// Queue is at capacity.
    #[error("task queue is full, retry after {retry_after_seconds}s")]
    Backpressure {
        /// Suggested wait before retrying
        retry_after_seconds: u64,
    },

    /// Caller exceeded its request allowance.
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the oldest request leaves the window
        retry_after_seconds: u64,
    },

    /// The work function failed on the inline path.
    #[error("work failed for task {task_id}: {message}")]
    WorkFailure {
        /// Task recorded as failed
        task_id: TaskId,
        /// Failure classification
        message: String,
    },

    /// Shutdown has begun; no new work is accepted.
    #[error("service is shutting down")]
    ShuttingDown,

    /// Shutdown did not finish in time.
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// Configured bound
        timeout: Duration,
    },

    /// Pipeline could not be assembled.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),
}

impl PipelineError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SsrfRejected(_) => "SSRF_REJECTED",
            Self::Backpressure { .. } => "BACKPRESSURE",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::WorkFailure { .. } => "WORK_FAILURE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Retry hint for errors the caller should retry later.
    pub const fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::Backpressure { retry_after_seconds }
            | Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

/// Maps a guard rejection onto the error taxonomy.
///
/// Oversized and unparseable URLs are request-shape problems; everything
/// else is a safety rejection.
impl From<UnsafeReason> for PipelineError {
    fn from(reason: UnsafeReason) -> Self {
        match reason {
            UnsafeReason::TooLong { .. } | UnsafeReason::Malformed(_) => {
                Self::Validation(format!("callback_url: {reason}"))
            },
            other => Self::SsrfRejected(other),
        }
    }
}
