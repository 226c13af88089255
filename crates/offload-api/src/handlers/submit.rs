//! Submission handlers for the sync and async paths.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{error::ApiError, server::AppState};

/// Body of `POST /sync`.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// Text to hash
    pub input: String,
    /// Hash rounds; the configured default when absent
    #[serde(default)]
    pub iterations: Option<u32>,
}

/// Body of `POST /async`.
#[derive(Debug, Deserialize)]
pub struct AsyncRequest {
    /// Text to hash
    pub input: String,
    /// Hash rounds; the configured default when absent
    #[serde(default)]
    pub iterations: Option<u32>,
    /// Where the result is posted
    pub callback_url: String,
}

/// Inline result.
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    /// Persisted task id
    pub request_id: String,
    /// Always `succeeded`
    pub status: &'static str,
    /// Final hex digest
    pub result: String,
    /// Rounds performed
    pub iterations: u32,
    /// Computation time
    pub duration_ms: u64,
}

/// Acknowledgement of a queued task.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    /// Persisted task id
    pub request_id: String,
    /// Always `accepted`
    pub status: &'static str,
    /// Human-readable note
    pub message: &'static str,
}

/// Computes the result while the caller waits.
///
/// # Errors
///
/// - 422: invalid body, input, or iteration count
/// - 500: work failed (the task is recorded as failed)
/// - 503: shutting down
#[instrument(name = "submit_sync", skip_all)]
pub async fn submit_sync(
    State(state): State<AppState>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::validation(e.body_text()))?;

    let result = state.pipeline.submit_sync(request.input, request.iterations).await?;
    info!(task_id = %result.task_id, duration_ms = result.duration_ms, "sync request completed");

    Ok(Json(SyncResponse {
        request_id: result.task_id.to_string(),
        status: "succeeded",
        result: result.result,
        iterations: result.iterations,
        duration_ms: result.duration_ms,
    }))
}

/// Queues the work and returns immediately; the result is posted to the
/// callback URL when ready.
///
/// # Errors
///
/// - 400: callback URL fails safety validation
/// - 422: invalid body, input, iteration count, or URL shape
/// - 503: queue full or shutting down, with `Retry-After`
#[instrument(name = "submit_async", skip_all)]
pub async fn submit_async(
    State(state): State<AppState>,
    body: Result<Json<AsyncRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::validation(e.body_text()))?;

    let accepted = state
        .pipeline
        .submit_async(request.input, request.iterations, request.callback_url)
        .await?;
    info!(task_id = %accepted.task_id, "async request accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            request_id: accepted.task_id.to_string(),
            status: "accepted",
            message: "Request queued; the result will be posted to the callback URL",
        }),
    )
        .into_response())
}
