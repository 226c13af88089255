//! Bounded FIFO task queue with fail-fast admission.
//!
//! Submission reserves a queue slot before anything is persisted, so a full
//! queue rejects without side effects and every persisted `pending` task has
//! a queued entry behind it. If persistence fails the reserved slot is
//! released and the task is never queued.
//!
//! Workers suspend in [`TaskQueue::take`]; submitters never suspend on
//! capacity.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use offload_core::{Task, TaskId, TaskStore};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Bounded queue shared by the submission path and the worker pool.
#[derive(Debug)]
pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    capacity: usize,
    retry_after_seconds: u64,
    closed: AtomicBool,
}

impl TaskQueue {
    /// Creates a queue holding at most `capacity` tasks. A full queue tells
    /// callers to come back after `retry_after_seconds`. A capacity of zero
    /// is treated as one.
    pub fn new(capacity: usize, retry_after_seconds: u64) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            capacity,
            retry_after_seconds,
            closed: AtomicBool::new(false),
        }
    }

    /// Persists `task` and queues it, or rejects immediately.
    ///
    /// # Errors
    ///
    /// - `Backpressure` when the queue is at capacity; nothing is persisted
    /// - `ShuttingDown` once the queue is closed
    /// - `Storage` if the task cannot be persisted; the slot is released
    pub async fn submit(&self, task: Task, store: &dyn TaskStore) -> Result<TaskId> {
        if self.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }

        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                debug!(capacity = self.capacity, "task queue full, rejecting submission");
                return Err(PipelineError::Backpressure {
                    retry_after_seconds: self.retry_after_seconds,
                });
            },
            Err(TrySendError::Closed(())) => return Err(PipelineError::ShuttingDown),
        };

        // Dropping the permit on error gives the slot back.
        let id = store.create_task(task.clone()).await?;
        permit.send(task);
        debug!(task_id = %id, depth = self.depth(), "task queued");
        Ok(id)
    }

    /// Waits for the next task in submission order.
    ///
    /// Returns `None` once the queue is closed and empty. Cancel-safe: a task
    /// is never lost if the returned future is dropped before completing.
    pub async fn take(&self) -> Option<Task> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Tasks queued or reserved but not yet taken.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity().saturating_sub(self.sender.capacity())
    }

    /// Maximum number of queued tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue has stopped accepting submissions.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting submissions. Queued tasks stay takeable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Closes the queue and removes every task that was never taken.
    ///
    /// Waits for submissions that already hold a slot to finish, so no task
    /// persisted as `pending` can slip in after the drain.
    pub async fn drain(&self) -> Vec<Task> {
        self.close();
        let mut receiver = self.receiver.lock().await;
        receiver.close();

        let mut remaining = Vec::new();
        while let Some(task) = receiver.recv().await {
            remaining.push(task);
        }
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "drained tasks that never reached a worker");
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use offload_core::{MemoryTaskStore, TaskStatus};

    use super::*;

    fn task(input: &str) -> Task {
        Task::new_async(input, 10, "https://example.com/cb", Utc::now())
    }

    #[tokio::test]
    async fn tasks_come_out_in_submission_order() {
        let store = MemoryTaskStore::new();
        let queue = TaskQueue::new(8, 5);

        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(queue.submit(task(&format!("t{n}")), &store).await.unwrap());
        }
        assert_eq!(queue.depth(), 5);

        for expected in ids {
            assert_eq!(queue.take().await.unwrap().id, expected);
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_persisting() {
        let store = MemoryTaskStore::new();
        let queue = TaskQueue::new(2, 7);

        queue.submit(task("a"), &store).await.unwrap();
        queue.submit(task("b"), &store).await.unwrap();

        let rejected = task("c");
        let rejected_id = rejected.id;
        let err = queue.submit(rejected, &store).await.unwrap_err();

        assert!(matches!(err, PipelineError::Backpressure { retry_after_seconds: 7 }));
        assert_eq!(store.task_count().await, 2);
        assert!(store.get_task(rejected_id).await.unwrap().is_none());
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn taking_frees_a_slot() {
        let store = MemoryTaskStore::new();
        let queue = TaskQueue::new(1, 5);

        queue.submit(task("a"), &store).await.unwrap();
        assert!(queue.submit(task("b"), &store).await.is_err());

        queue.take().await.unwrap();
        assert!(queue.submit(task("b"), &store).await.is_ok());
    }

    #[tokio::test]
    async fn storage_failure_releases_slot() {
        let store = MemoryTaskStore::new();
        let queue = TaskQueue::new(1, 5);

        store.inject_write_error("disk full").await;
        let err = queue.submit(task("a"), &store).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(queue.depth(), 0);

        queue.submit(task("b"), &store).await.unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn drain_returns_untaken_tasks_and_closes() {
        let store = MemoryTaskStore::new();
        let queue = TaskQueue::new(4, 5);

        queue.submit(task("a"), &store).await.unwrap();
        queue.submit(task("b"), &store).await.unwrap();
        queue.take().await.unwrap();

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].input, "b");
        assert_eq!(drained[0].status, TaskStatus::Pending);

        assert!(matches!(
            queue.submit(task("c"), &store).await,
            Err(PipelineError::ShuttingDown)
        ));
        assert!(queue.take().await.is_none());
    }
}
