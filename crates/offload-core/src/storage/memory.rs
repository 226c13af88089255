//! In-memory task store for tests.
//!
//! Mirrors the SQLite store's rules without a database and supports
//! injecting failures to exercise error paths.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tokio::sync::RwLock;

use super::TaskStore;
use crate::{
    error::{CoreError, Result},
    models::{CallbackStatus, DeliveryAttempt, Page, StatusUpdate, Task, TaskFilter, TaskId},
};

struct InjectedFailure {
    skip: usize,
    remaining: usize,
    message: String,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, (u64, Task)>,
    attempts: HashMap<TaskId, Vec<DeliveryAttempt>>,
    next_seq: u64,
}

/// In-memory task store with configurable failure injection.
#[derive(Clone)]
pub struct MemoryTaskStore {
    state: Arc<RwLock<State>>,
    write_errors: Arc<RwLock<Option<InjectedFailure>>>,
    healthy: Arc<RwLock<bool>>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            write_errors: Arc::new(RwLock::new(None)),
            healthy: Arc::new(RwLock::new(true)),
        }
    }

    /// Makes the next write operation fail with a database error.
    pub async fn inject_write_error(&self, message: impl Into<String>) {
        self.inject_write_errors(message, 1).await;
    }

    /// Makes the next `count` write operations fail with a database error.
    pub async fn inject_write_errors(&self, message: impl Into<String>, count: usize) {
        self.inject_write_errors_after(0, message, count).await;
    }

    /// Lets `skip` writes succeed, then fails the following `count`.
    pub async fn inject_write_errors_after(
        &self,
        skip: usize,
        message: impl Into<String>,
        count: usize,
    ) {
        *self.write_errors.write().await = (count > 0).then(|| InjectedFailure {
            skip,
            remaining: count,
            message: message.into(),
        });
    }

    /// Controls the result of `health_check`.
    pub async fn set_healthy(&self, healthy: bool) {
        *self.healthy.write().await = healthy;
    }

    /// Number of tasks stored.
    pub async fn task_count(&self) -> usize {
        self.state.read().await.tasks.len()
    }

    async fn take_injected(&self) -> Result<()> {
        let mut injected = self.write_errors.write().await;
        let Some(failure) = injected.as_mut() else {
            return Ok(());
        };
        if failure.skip > 0 {
            failure.skip -= 1;
            return Ok(());
        }
        let err = CoreError::Database(failure.message.clone());
        failure.remaining -= 1;
        if failure.remaining == 0 {
            *injected = None;
        }
        Err(err)
    }
}

impl TaskStore for MemoryTaskStore {
    fn create_task(&self, task: Task) -> Pin<Box<dyn Future<Output = Result<TaskId>> + Send + '_>> {
        Box::pin(async move {
            self.take_injected().await?;
            let mut state = self.state.write().await;
            if state.tasks.contains_key(&task.id) {
                return Err(CoreError::ConstraintViolation(format!("task {} exists", task.id)));
            }
            let id = task.id;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(id, (seq, task));
            Ok(id)
        })
    }

    fn update_task_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.take_injected().await?;
            let mut state = self.state.write().await;
            let (_, task) = state
                .tasks
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
            task.apply(&update).map_err(|from| CoreError::InvalidTransition {
                id,
                from,
                to: update.status,
            })
        })
    }

    fn append_delivery_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.take_injected().await?;
            let mut state = self.state.write().await;
            let id = attempt.task_id;
            if !state.tasks.contains_key(&id) {
                return Err(CoreError::NotFound(format!("task {id}")));
            }

            let trace = state.attempts.entry(id).or_default();
            let expected = u32::try_from(trace.len()).unwrap_or(u32::MAX).saturating_add(1);
            if attempt.attempt_number != expected {
                return Err(CoreError::ConstraintViolation(format!(
                    "attempt {} out of sequence for task {id}, expected {expected}",
                    attempt.attempt_number
                )));
            }
            let number = attempt.attempt_number;
            trace.push(attempt);

            if let Some((_, task)) = state.tasks.get_mut(&id) {
                task.callback_attempts = number;
            }
            Ok(())
        })
    }

    fn update_delivery_status(
        &self,
        id: TaskId,
        status: CallbackStatus,
        error: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.take_injected().await?;
            let mut state = self.state.write().await;
            let (_, task) = state
                .tasks
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
            if task.callback_status != Some(CallbackStatus::Pending) {
                return Err(CoreError::ConstraintViolation(format!(
                    "delivery for task {id} already settled"
                )));
            }
            task.callback_status = Some(status);
            task.callback_error = error;
            Ok(())
        })
    }

    fn get_task(&self, id: TaskId) -> Pin<Box<dyn Future<Output = Result<Option<Task>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self.state.read().await.tasks.get(&id).map(|(_, task)| task.clone()))
        })
    }

    fn delivery_trace(
        &self,
        id: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self.state.read().await.attempts.get(&id).cloned().unwrap_or_default())
        })
    }

    fn list_tasks(
        &self,
        filter: TaskFilter,
        page: Page,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Task>>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut rows: Vec<&(u64, Task)> =
                state.tasks.values().filter(|(_, task)| filter.matches(task)).collect();
            rows.sort_by(|a, b| {
                b.1.submitted_at.cmp(&a.1.submitted_at).then_with(|| b.0.cmp(&a.0))
            });
            Ok(rows
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .map(|(_, task)| task.clone())
                .collect())
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if *self.healthy.read().await {
                Ok(())
            } else {
                Err(CoreError::Database("store marked unhealthy".into()))
            }
        })
    }
}
