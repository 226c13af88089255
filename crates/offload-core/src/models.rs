//! Core domain models and strongly-typed identifiers.
//!
//! Defines tasks, delivery attempts, and the lifecycle enums that flow
//! through the pipeline. Status transition rules live here so that every
//! store enforces the same forward-only lifecycle.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly-typed task identifier.
///
/// Wraps a UUID generated at submission time. The identifier is returned to
/// the caller on acceptance and is the only handle for later queries.
///
/// # Example
///
/// ```
/// use offload_core::models::TaskId;
/// let id = TaskId::new();
/// println!("Processing task: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Creates a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which submission path produced a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Executed inline by the request handler.
    Sync,
    /// Queued for the worker pool with a callback on completion.
    Async,
}

impl TaskMode {
    /// Returns the persisted representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            _ => Err(format!("invalid task mode: {s}")),
        }
    }
}

/// Task lifecycle status.
///
/// Tasks only move forward:
///
/// ```text
/// Pending -> Running -> Succeeded
///    |              -> Failed
///    +-> Failed (abandoned before execution)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted and queued, waiting for a worker.
    Pending,

    /// Claimed by a worker; the work function is executing.
    Running,

    /// Work completed and a result is recorded.
    Succeeded,

    /// Work raised, or the task was abandoned before it could run.
    Failed,
}

impl TaskStatus {
    /// Returns the persisted representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Whether no further status change is permitted.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }

    /// Statuses from which `self` may be reached.
    pub const fn predecessors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[],
            Self::Running => &[Self::Pending],
            Self::Succeeded => &[Self::Running],
            Self::Failed => &[Self::Pending, Self::Running],
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Summary of callback delivery, tracked independently of task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    /// Delivery has not finished yet.
    Pending,
    /// A 2xx response was received.
    Delivered,
    /// Attempts were exhausted or the URL was rejected at delivery time.
    Failed,
    /// Shutdown interrupted the retry sequence.
    Abandoned,
}

impl CallbackStatus {
    /// Returns the persisted representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether delivery has reached its final state.
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("invalid callback status: {s}")),
        }
    }
}

/// Result of one entry in a delivery trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Endpoint answered with a success status.
    Delivered,
    /// Network error, timeout, or non-success status.
    Failed,
    /// URL failed safety validation; no request was sent.
    Rejected,
    /// Retry sequence interrupted by shutdown; no request was sent.
    Abandoned,
}

impl AttemptOutcome {
    /// Returns the persisted representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("invalid attempt outcome: {s}")),
        }
    }
}

/// A unit of CPU-bound work and its recorded lifecycle.
///
/// Owned by a single worker while `Running`. Once terminal, only the delivery
/// summary fields change, and only through the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier generated at submission.
    pub id: TaskId,

    /// Submission path.
    pub mode: TaskMode,

    /// Opaque input payload.
    pub input: String,

    /// Number of hashing rounds to perform.
    pub iterations: u32,

    /// Callback destination; present only for async tasks.
    pub callback_url: Option<String>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Work result, present once succeeded.
    pub result: Option<String>,

    /// Error classification, present once failed.
    pub error: Option<String>,

    /// Time spent in the work function.
    pub duration_ms: Option<u64>,

    /// When the task was accepted.
    pub submitted_at: DateTime<Utc>,

    /// When a worker began executing it.
    pub started_at: Option<DateTime<Utc>>,

    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Delivery summary; `None` for sync tasks.
    pub callback_status: Option<CallbackStatus>,

    /// Number of trace entries recorded so far.
    pub callback_attempts: u32,

    /// Last delivery error, if any.
    pub callback_error: Option<String>,
}

impl Task {
    /// Creates a pending task for the inline path.
    pub fn new_sync(input: impl Into<String>, iterations: u32, submitted_at: DateTime<Utc>) -> Self {
        Self::new(TaskMode::Sync, input.into(), iterations, None, submitted_at)
    }

    /// Creates a pending task for the queued path.
    pub fn new_async(
        input: impl Into<String>,
        iterations: u32,
        callback_url: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self::new(TaskMode::Async, input.into(), iterations, Some(callback_url.into()), submitted_at)
    }

    fn new(
        mode: TaskMode,
        input: String,
        iterations: u32,
        callback_url: Option<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let callback_status = callback_url.as_ref().map(|_| CallbackStatus::Pending);
        Self {
            id: TaskId::new(),
            mode,
            input,
            iterations,
            callback_url,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            duration_ms: None,
            submitted_at,
            started_at: None,
            completed_at: None,
            callback_status,
            callback_attempts: 0,
            callback_error: None,
        }
    }

    /// Applies a status update in memory, clamping timestamps so they never
    /// precede earlier lifecycle points.
    ///
    /// # Errors
    ///
    /// Returns the current status if the transition is not allowed.
    pub fn apply(&mut self, update: &StatusUpdate) -> Result<(), TaskStatus> {
        if !self.status.can_transition_to(update.status) {
            return Err(self.status);
        }
        let floor = self.started_at.unwrap_or(self.submitted_at);
        let at = update.at.max(floor);
        self.status = update.status;
        match update.status {
            TaskStatus::Running => self.started_at = Some(at),
            _ => {
                self.completed_at = Some(at);
                self.result.clone_from(&update.result);
                self.error.clone_from(&update.error);
                self.duration_ms = update.duration_ms;
            },
        }
        Ok(())
    }
}

/// A requested status change together with the data that accompanies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Target status.
    pub status: TaskStatus,
    /// Result payload when succeeding.
    pub result: Option<String>,
    /// Error classification when failing.
    pub error: Option<String>,
    /// Work duration.
    pub duration_ms: Option<u64>,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Worker claimed the task.
    pub fn running(at: DateTime<Utc>) -> Self {
        Self { status: TaskStatus::Running, result: None, error: None, duration_ms: None, at }
    }

    /// Work produced a result.
    pub fn succeeded(result: impl Into<String>, duration_ms: u64, at: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            result: Some(result.into()),
            error: None,
            duration_ms: Some(duration_ms),
            at,
        }
    }

    /// Work raised or the task was abandoned.
    pub fn failed(error: impl Into<String>, duration_ms: Option<u64>, at: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            duration_ms,
            at,
        }
    }
}

/// One entry in a task's append-only delivery trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Task this attempt belongs to.
    pub task_id: TaskId,

    /// 1-based, gapless sequence number.
    pub attempt_number: u32,

    /// When the attempt started.
    pub attempted_at: DateTime<Utc>,

    /// What happened.
    pub outcome: AttemptOutcome,

    /// HTTP status code, when a response was received.
    pub status_code: Option<u16>,

    /// Error classification and detail, when not delivered.
    pub error: Option<String>,

    /// Wall time of the attempt.
    pub duration_ms: u64,

    /// When the next attempt is scheduled, if one is.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// Whether the endpoint accepted the payload.
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Delivered
    }
}

/// Optional filters for listing tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Restrict to one submission path.
    pub mode: Option<TaskMode>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    /// Whether `task` passes the filter.
    pub fn matches(&self, task: &Task) -> bool {
        self.mode.is_none_or(|mode| mode == task.mode)
            && self.status.is_none_or(|status| status == task.status)
    }
}

/// Pagination window for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}
