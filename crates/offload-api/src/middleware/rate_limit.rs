//! Per-client rate limiting.
//!
//! Clients are keyed by peer IP address. Requests arriving without
//! connection info (in-process tests, unusual transports) share one key.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use offload_pipeline::{Admission, PipelineError};
use tracing::warn;

use crate::{error::ApiError, server::AppState};

/// Header reporting how many requests remain in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

const UNKNOWN_CLIENT: &str = "unknown";

/// Admits the request or answers `429` with `Retry-After`.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);

    match state.limiter.admit(&key) {
        Admission::Allowed { remaining } => {
            let mut response = next.run(request).await;
            response.headers_mut().insert(REMAINING_HEADER, HeaderValue::from(remaining));
            response
        },
        Admission::Denied { retry_after_seconds } => {
            warn!(client = %key, retry_after_seconds, "rate limit exceeded");
            ApiError::from(PipelineError::RateLimited { retry_after_seconds }).into_response()
        },
    }
}

fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| UNKNOWN_CLIENT.to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}
