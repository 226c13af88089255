//! Single worker loop: take a task, run it, record it, hand it off.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use offload_core::{
    with_write_retries, Clock, StatusUpdate, Task, TaskId, TaskStatus, TaskStore, Workload,
};
use offload_delivery::{CallbackDelivery, DeliveryJob};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{error::Result, queue::TaskQueue};

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub store: Arc<dyn TaskStore>,
    pub workload: Arc<dyn Workload>,
    pub delivery: CallbackDelivery,
    pub deliveries: TaskTracker,
    pub busy: Arc<AtomicUsize>,
    pub clock: Arc<dyn Clock>,
}

/// Worker that executes queued tasks until cancelled.
pub(crate) struct TaskWorker {
    id: usize,
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
}

impl TaskWorker {
    pub(crate) fn new(id: usize, ctx: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { id, ctx, cancellation_token }
    }

    /// Runs until cancelled or the queue closes. A task already taken is
    /// always finished before the loop checks for cancellation again.
    pub(crate) async fn run(self) -> Result<()> {
        loop {
            let task = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => {
                    debug!(worker_id = self.id, "worker cancelled");
                    break;
                },
                next = self.ctx.queue.take() => match next {
                    Some(task) => task,
                    None => {
                        debug!(worker_id = self.id, "queue closed");
                        break;
                    },
                },
            };

            let _busy = BusyGuard::enter(&self.ctx.busy);
            self.process(task).await;
        }
        Ok(())
    }

    /// Executes one task. Failures are recorded on the task, never returned,
    /// so one bad task cannot stop the worker.
    ///
    /// A task taken from the queue always ends terminal: if a status write
    /// keeps failing, the task is recorded failed instead.
    async fn process(&self, mut task: Task) {
        let task_id = task.id;
        let store = self.ctx.store.as_ref();
        let clock = self.ctx.clock.as_ref();

        let running = StatusUpdate::running(clock.now_utc());
        if let Err(e) = record_status(store, clock, task_id, &running).await {
            error!(worker_id = self.id, task_id = %task_id, error = %e, "failed to mark task running");
            self.fail(task, format!("task could not be started: {e}")).await;
            return;
        }
        // In-memory copy mirrors the stored row; the store already accepted
        // this transition.
        let _ = task.apply(&running);

        let workload = self.ctx.workload.clone();
        let input = task.input.clone();
        let iterations = task.iterations;
        let outcome = tokio::task::spawn_blocking(move || workload.run(&input, iterations)).await;

        let finished_at = self.ctx.clock.now_utc();
        let update = match outcome {
            Ok(Ok(output)) => {
                debug!(
                    worker_id = self.id,
                    task_id = %task_id,
                    duration_ms = output.duration_ms,
                    "work completed"
                );
                StatusUpdate::succeeded(output.result, output.duration_ms, finished_at)
            },
            Ok(Err(e)) => {
                warn!(worker_id = self.id, task_id = %task_id, error = %e, "work failed");
                StatusUpdate::failed(e.to_string(), None, finished_at)
            },
            Err(join_error) => {
                error!(worker_id = self.id, task_id = %task_id, error = %join_error, "work panicked");
                StatusUpdate::failed(format!("work panicked: {join_error}"), None, finished_at)
            },
        };

        if let Err(e) = record_status(store, clock, task_id, &update).await {
            error!(worker_id = self.id, task_id = %task_id, error = %e, "failed to record task result");
            self.fail(task, format!("task result could not be recorded: {e}")).await;
            return;
        }
        let _ = task.apply(&update);
        info!(
            worker_id = self.id,
            task_id = %task_id,
            status = %task.status,
            "task finished"
        );

        self.hand_off(&task);
    }

    async fn fail(&self, mut task: Task, message: String) {
        let update = StatusUpdate::failed(message, None, self.ctx.clock.now_utc());
        if record_failure(self.ctx.store.as_ref(), self.ctx.clock.as_ref(), task.id, &update).await {
            let _ = task.apply(&update);
            self.hand_off(&task);
        }
    }

    fn hand_off(&self, task: &Task) {
        debug_assert!(matches!(task.status, TaskStatus::Succeeded | TaskStatus::Failed));
        let Some(job) = DeliveryJob::from_task(task) else {
            return;
        };

        let delivery = self.ctx.delivery.clone();
        self.ctx.deliveries.spawn(async move {
            let task_id = job.task_id;
            match delivery.deliver(job).await {
                Ok(outcome) => debug!(task_id = %task_id, ?outcome, "delivery sequence ended"),
                Err(e) => error!(task_id = %task_id, error = %e, "delivery sequence aborted"),
            }
        });
    }
}

/// Writes a status change, retrying transient store failures.
pub(crate) async fn record_status(
    store: &dyn TaskStore,
    clock: &dyn Clock,
    id: TaskId,
    update: &StatusUpdate,
) -> offload_core::Result<()> {
    with_write_retries(clock, "update_task_status", || store.update_task_status(id, update.clone()))
        .await
}

/// Best-effort terminal failure for a task whose normal status write failed.
/// Returns whether the failure was recorded.
pub(crate) async fn record_failure(
    store: &dyn TaskStore,
    clock: &dyn Clock,
    id: TaskId,
    update: &StatusUpdate,
) -> bool {
    debug_assert_eq!(update.status, TaskStatus::Failed);
    match record_status(store, clock, id, update).await {
        Ok(()) => true,
        Err(e) => {
            error!(task_id = %id, error = %e, "failed to record task failure; left for reconciliation");
            false
        },
    }
}

/// Counts a worker as busy for as long as the guard lives, including when
/// processing unwinds.
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
