//! Error types for callback delivery operations.
//!
//! Every failed attempt is classified into an `ErrorCategory`, which is what
//! the delivery trace records alongside the human-readable message.

use std::fmt;

use thiserror::Error;

use crate::url_guard::UnsafeReason;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions that can occur while delivering a callback.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection could not be established or broke mid-request.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Request exceeded the per-attempt timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Endpoint answered with a non-success status.
    #[error("HTTP {status_code} response")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body content (truncated)
        body: String,
    },

    /// Endpoint answered with a redirect, which is never followed.
    #[error("redirect {status_code} not followed{}", location_suffix(.location))]
    Redirected {
        /// HTTP status code (3xx)
        status_code: u16,
        /// Location header, if present
        location: Option<String>,
    },

    /// Callback URL failed safety validation.
    #[error("unsafe callback URL: {0}")]
    UnsafeUrl(#[from] UnsafeReason),

    /// Persisting delivery state failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// HTTP client could not be configured.
    #[error("invalid client configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },
}

fn location_suffix(location: &Option<String>) -> String {
    location.as_ref().map(|l| format!(" (to {l})")).unwrap_or_default()
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error for a non-success status code.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates an error for an unfollowed redirect.
    pub fn redirected(status_code: u16, location: Option<String>) -> Self {
        Self::Redirected { status_code, location }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether another attempt could succeed.
    ///
    /// Network errors, timeouts, and every non-success response are retried.
    /// Unsafe URLs, storage, and configuration failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::Redirected { .. } => true,

            Self::UnsafeUrl(_) | Self::Storage { .. } | Self::Configuration { .. } => false,
        }
    }

    /// Status code carried by the error, if a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status_code, .. } | Self::Redirected { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }

    /// Category and message in the form recorded in the trace.
    pub fn trace_message(&self) -> String {
        format!("{}: {self}", ErrorCategory::from(self))
    }
}

impl From<offload_core::CoreError> for DeliveryError {
    fn from(err: offload_core::CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

/// Category of delivery error recorded in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection failures.
    Network,
    /// Per-attempt timeout.
    Timeout,
    /// Non-success status codes.
    HttpStatus,
    /// Redirect responses.
    Redirect,
    /// SSRF validation failures.
    Unsafe,
    /// Persistence failures.
    Storage,
    /// Client configuration problems.
    Configuration,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } => Self::Network,
            DeliveryError::Timeout { .. } => Self::Timeout,
            DeliveryError::HttpStatus { .. } => Self::HttpStatus,
            DeliveryError::Redirected { .. } => Self::Redirect,
            DeliveryError::UnsafeUrl(_) => Self::Unsafe,
            DeliveryError::Storage { .. } => Self::Storage,
            DeliveryError::Configuration { .. } => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::HttpStatus => write!(f, "http_status"),
            Self::Redirect => write!(f, "redirect"),
            Self::Unsafe => write!(f, "unsafe_url"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
