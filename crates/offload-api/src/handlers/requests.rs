//! Query handlers for stored requests and their delivery traces.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use offload_core::{
    AttemptOutcome, CallbackStatus, DeliveryAttempt, Page, Task, TaskFilter, TaskId, TaskMode,
    TaskStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{error::ApiError, server::AppState};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Query string of `GET /requests`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Filter by submission path
    pub mode: Option<TaskMode>,
    /// Filter by status
    pub status: Option<TaskStatus>,
    /// Page size, 1 to 200
    pub limit: Option<u32>,
    /// Rows to skip
    pub offset: Option<u32>,
}

/// One row of the listing.
#[derive(Debug, Serialize)]
pub struct RequestSummary {
    /// Task id
    pub request_id: TaskId,
    /// Submission path
    pub mode: TaskMode,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Hash rounds
    pub iterations: u32,
    /// Creation time
    pub submitted_at: DateTime<Utc>,
    /// Finish time
    pub completed_at: Option<DateTime<Utc>>,
    /// Delivery summary for async tasks
    pub callback_status: Option<CallbackStatus>,
}

impl From<Task> for RequestSummary {
    fn from(task: Task) -> Self {
        Self {
            request_id: task.id,
            mode: task.mode,
            status: task.status,
            iterations: task.iterations,
            submitted_at: task.submitted_at,
            completed_at: task.completed_at,
            callback_status: task.callback_status,
        }
    }
}

/// Response of `GET /requests`.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Matching requests, newest first
    pub requests: Vec<RequestSummary>,
    /// Page size applied
    pub limit: u32,
    /// Rows skipped
    pub offset: u32,
}

/// One entry of a delivery trace.
#[derive(Debug, Serialize)]
pub struct AttemptView {
    /// 1-based position
    pub attempt_number: u32,
    /// When the attempt started
    pub attempted_at: DateTime<Utc>,
    /// Result
    pub outcome: AttemptOutcome,
    /// Receiver's status code, if one was returned
    pub status_code: Option<u16>,
    /// Failure classification
    pub error: Option<String>,
    /// Attempt duration
    pub duration_ms: u64,
    /// Scheduled retry time after a failure
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl From<DeliveryAttempt> for AttemptView {
    fn from(attempt: DeliveryAttempt) -> Self {
        Self {
            attempt_number: attempt.attempt_number,
            attempted_at: attempt.attempted_at,
            outcome: attempt.outcome,
            status_code: attempt.status_code,
            error: attempt.error,
            duration_ms: attempt.duration_ms,
            next_retry_at: attempt.next_retry_at,
        }
    }
}

/// Response of `GET /requests/{id}`.
#[derive(Debug, Serialize)]
pub struct RequestDetail {
    /// Task id
    pub request_id: TaskId,
    /// Submission path
    pub mode: TaskMode,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Submitted text
    pub input: String,
    /// Hash rounds
    pub iterations: u32,
    /// Hex digest on success
    pub result: Option<String>,
    /// Failure classification
    pub error: Option<String>,
    /// Computation time
    pub duration_ms: Option<u64>,
    /// Callback target for async tasks
    pub callback_url: Option<String>,
    /// Creation time
    pub submitted_at: DateTime<Utc>,
    /// Work start
    pub started_at: Option<DateTime<Utc>>,
    /// Work finish
    pub completed_at: Option<DateTime<Utc>>,
    /// Delivery summary
    pub callback_status: Option<CallbackStatus>,
    /// Delivery attempts made
    pub callback_attempts: u32,
    /// Last delivery failure
    pub callback_error: Option<String>,
    /// Every delivery attempt in order
    pub delivery_trace: Vec<AttemptView>,
}

impl RequestDetail {
    fn new(task: Task, trace: Vec<DeliveryAttempt>) -> Self {
        Self {
            request_id: task.id,
            mode: task.mode,
            status: task.status,
            input: task.input,
            iterations: task.iterations,
            result: task.result,
            error: task.error,
            duration_ms: task.duration_ms,
            callback_url: task.callback_url,
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            callback_status: task.callback_status,
            callback_attempts: task.callback_attempts,
            callback_error: task.callback_error,
            delivery_trace: trace.into_iter().map(AttemptView::from).collect(),
        }
    }
}

/// Lists requests, newest first.
///
/// # Errors
///
/// - 422: unknown filter value or limit outside 1 to 200
/// - 500: store failure
#[instrument(name = "list_requests", skip_all)]
pub async fn list_requests(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::validation(e.body_text()))?;

    let page = Page {
        limit: query.limit.unwrap_or(Page::default().limit),
        offset: query.offset.unwrap_or(0),
    };
    if page.limit == 0 || page.limit > MAX_PAGE_SIZE {
        return Err(ApiError::validation(format!("limit must be between 1 and {MAX_PAGE_SIZE}")));
    }

    let filter = TaskFilter { mode: query.mode, status: query.status };
    let tasks = state.pipeline.list_tasks(filter, page).await?;
    debug!(count = tasks.len(), "listed requests");

    Ok(Json(ListResponse {
        requests: tasks.into_iter().map(RequestSummary::from).collect(),
        limit: page.limit,
        offset: page.offset,
    }))
}

/// Returns one request with its delivery trace.
///
/// # Errors
///
/// - 404: no such request
/// - 422: id is not a UUID
/// - 500: store failure
#[instrument(name = "get_request", skip(state))]
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestDetail>, ApiError> {
    let id: TaskId =
        id.parse().map_err(|_| ApiError::validation(format!("invalid request id '{id}'")))?;

    let task = state
        .pipeline
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("request {id} not found")))?;
    let trace = state.pipeline.delivery_trace(id).await?;

    Ok(Json(RequestDetail::new(task, trace)))
}
