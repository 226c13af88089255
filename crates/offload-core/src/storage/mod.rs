//! Persistence contract for task state and delivery traces.
//!
//! The store is the single source of truth: a pipeline operation counts as
//! complete only once the matching call here has returned `Ok`. Both
//! implementations enforce the same rules so tests against the in-memory
//! store carry over to SQLite:
//!
//! - task status only moves forward (see [`TaskStatus::can_transition_to`]);
//! - delivery attempts are append-only and numbered 1, 2, 3... without gaps;
//! - a task's callback status settles exactly once.
//!
//! [`TaskStatus::can_transition_to`]: crate::models::TaskStatus::can_transition_to

use std::{future::Future, pin::Pin, time::Duration};

use tracing::warn;

use crate::{
    error::Result,
    models::{CallbackStatus, DeliveryAttempt, Page, StatusUpdate, Task, TaskFilter, TaskId},
    time::Clock,
};

pub mod memory;
pub mod sqlite;

/// Storage operations required by the pipeline and delivery engine.
///
/// Object-safe so components can hold an `Arc<dyn TaskStore>` and tests can
/// substitute [`memory::MemoryTaskStore`].
pub trait TaskStore: Send + Sync + 'static {
    /// Persists a new task and returns its identifier.
    fn create_task(&self, task: Task) -> Pin<Box<dyn Future<Output = Result<TaskId>> + Send + '_>>;

    /// Moves a task to a new status, recording result or error data.
    ///
    /// Fails with `InvalidTransition` if the move is not forward, and with
    /// `NotFound` if the task does not exist.
    fn update_task_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Appends one entry to a task's delivery trace.
    ///
    /// The entry's `attempt_number` must be exactly one more than the number
    /// of entries already recorded.
    fn append_delivery_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Settles the delivery summary of an async task.
    fn update_delivery_status(
        &self,
        id: TaskId,
        status: CallbackStatus,
        error: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Fetches a task by identifier.
    fn get_task(&self, id: TaskId) -> Pin<Box<dyn Future<Output = Result<Option<Task>>> + Send + '_>>;

    /// Returns a task's delivery trace ordered by attempt number.
    fn delivery_trace(
        &self,
        id: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>>;

    /// Lists tasks newest first.
    fn list_tasks(
        &self,
        filter: TaskFilter,
        page: Page,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Task>>> + Send + '_>>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Attempts [`with_write_retries`] makes before giving up.
pub const WRITE_ATTEMPTS: u32 = 4;

const WRITE_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Runs a store write, retrying transient failures with doubling backoff.
///
/// Non-transient errors (see [`CoreError::is_transient`]) are returned at
/// once. After [`WRITE_ATTEMPTS`] failed attempts the last error is returned.
///
/// [`CoreError::is_transient`]: crate::error::CoreError::is_transient
pub async fn with_write_retries<T, F, Fut>(
    clock: &dyn Clock,
    operation: &str,
    mut write: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < WRITE_ATTEMPTS => {
                let delay = WRITE_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "store write failed, retrying"
                );
                clock.sleep(delay).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{error::CoreError, storage::memory::MemoryTaskStore, time::TestClock};

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let store = MemoryTaskStore::new();
        let clock = TestClock::new();
        store.inject_write_errors("database is locked", 2).await;

        let task = Task::new_sync("x", 1, Utc::now());
        let id = with_write_retries(&clock, "create_task", || store.create_task(task.clone()))
            .await
            .unwrap();

        assert_eq!(id, task.id);
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_millis(50), Duration::from_millis(100)]
        );
    }

    #[tokio::test]
    async fn persistent_failure_gives_up_after_bounded_attempts() {
        let store = MemoryTaskStore::new();
        let clock = TestClock::new();
        store.inject_write_errors("disk full", 10).await;

        let task = Task::new_sync("x", 1, Utc::now());
        let err = with_write_retries(&clock, "create_task", || store.create_task(task.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Database(_)));
        assert_eq!(clock.recorded_sleeps().len(), WRITE_ATTEMPTS as usize - 1);
        assert_eq!(store.task_count().await, 0);
    }

    #[tokio::test]
    async fn lifecycle_errors_are_not_retried() {
        let store = MemoryTaskStore::new();
        let clock = TestClock::new();
        let id = store.create_task(Task::new_sync("x", 1, Utc::now())).await.unwrap();

        let err = with_write_retries(&clock, "update_task_status", || {
            store.update_task_status(id, StatusUpdate::succeeded("r", 1, Utc::now()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert!(clock.recorded_sleeps().is_empty());
    }
}
