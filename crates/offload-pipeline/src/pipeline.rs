//! The pipeline facade handed to the routing layer.
//!
//! A [`Pipeline`] is an explicitly constructed value, not global state: the
//! server owns one behind an `Arc`, and every test builds its own.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use offload_core::{
    Clock, DeliveryAttempt, Page, RealClock, Sha256Workload, StatusUpdate, Task, TaskFilter,
    TaskId, TaskMode, TaskStatus, TaskStore, Workload,
};
use offload_delivery::{
    CallbackDelivery, ClientConfig, DeliveryClient, DeliveryStats, GuardConfig, Resolver,
    RetryPolicy, SystemResolver, UrlGuard,
};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{PipelineError, Result},
    queue::TaskQueue,
    worker::{record_failure, record_status, WorkerContext},
    worker_pool::WorkerPool,
};

/// Error recorded on tasks that were still queued at shutdown.
pub const ABANDONED_BEFORE_EXECUTION: &str = "abandoned before execution";

/// Error recorded on async tasks found unfinished with nothing left to run
/// them.
pub const INTERRUPTED_BEFORE_COMPLETION: &str = "interrupted before completion";

/// Extra time past the shutdown deadline for recording queued tasks and
/// abandoned retries.
const SETTLE_GRACE: Duration = Duration::from_secs(1);

const RECONCILE_PAGE_SIZE: u32 = 200;

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Iterations used when a request does not specify any.
    pub default_iterations: u32,
    /// Largest accepted iteration count.
    pub max_iterations: u32,
    /// Largest accepted input, in characters.
    pub max_input_length: usize,
    /// Number of workers.
    pub worker_count: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Retry hint returned when the queue is full.
    pub backpressure_retry_after: Duration,
    /// Upper bound on the whole shutdown sequence.
    pub shutdown_timeout: Duration,
    /// Callback URL validation.
    pub guard: GuardConfig,
    /// Callback HTTP client.
    pub client: ClientConfig,
    /// Callback retry schedule.
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_iterations: 50_000,
            max_iterations: 1_000_000,
            max_input_length: 10_000,
            worker_count: 4,
            queue_capacity: 1000,
            backpressure_retry_after: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            guard: GuardConfig::default(),
            client: ClientConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of an inline computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Persisted task.
    pub task_id: TaskId,
    /// Hex digest.
    pub result: String,
    /// Iterations performed.
    pub iterations: u32,
    /// Time spent computing.
    pub duration_ms: u64,
}

/// Acknowledgement of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Identifier to poll.
    pub task_id: TaskId,
}

/// Point-in-time view of pipeline load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    /// Tasks waiting for a worker.
    pub queue_depth: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Workers currently executing a task.
    pub active_workers: usize,
    /// Configured worker count.
    pub worker_count: usize,
    /// Whether submissions are accepted.
    pub accepting: bool,
    /// Whether the store answered its health check.
    pub store_healthy: bool,
    /// Callback delivery counters.
    pub delivery: DeliveryStats,
}

/// What shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every worker stopped before the deadline.
    pub workers_stopped: bool,
    /// Queued tasks marked failed without running.
    pub abandoned_tasks: usize,
    /// Unfinished tasks with no queue entry, marked failed.
    pub interrupted_tasks: usize,
    /// Whether every delivery sequence ended before the deadline.
    pub deliveries_settled: bool,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    store: Arc<dyn TaskStore>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    workload: Arc<dyn Workload>,
    resolver: Arc<dyn Resolver>,
}

impl PipelineBuilder {
    /// Overrides the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the work function.
    #[must_use]
    pub fn workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = workload;
        self
    }

    /// Overrides hostname resolution for callback URLs.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Builds the pipeline. Workers are not running until
    /// [`Pipeline::start`].
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the callback HTTP client cannot be built.
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let guard = UrlGuard::with_resolver(config.guard.clone(), self.resolver);
        let client = DeliveryClient::new(config.client.clone())
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        let delivery = CallbackDelivery::new(
            self.store.clone(),
            guard.clone(),
            client,
            config.retry.clone(),
            self.clock.clone(),
        );

        Ok(Pipeline {
            queue: Arc::new(TaskQueue::new(
                config.queue_capacity,
                config.backpressure_retry_after.as_secs().max(1),
            )),
            store: self.store,
            guard,
            delivery,
            workload: self.workload,
            clock: self.clock,
            deliveries: TaskTracker::new(),
            busy: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
            workers: Mutex::new(None),
            config,
        })
    }
}

/// Request-processing pipeline: validation, queue, workers, and delivery.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    guard: UrlGuard,
    delivery: CallbackDelivery,
    workload: Arc<dyn Workload>,
    clock: Arc<dyn Clock>,
    deliveries: TaskTracker,
    busy: Arc<AtomicUsize>,
    accepting: AtomicBool,
    workers: Mutex<Option<WorkerPool>>,
}

impl Pipeline {
    /// Starts building a pipeline over `store`.
    pub fn builder(store: Arc<dyn TaskStore>, config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            store,
            config,
            clock: Arc::new(RealClock::new()),
            workload: Arc::new(Sha256Workload),
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Returns the pipeline settings.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Spawns the worker pool. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return;
        }

        let mut pool = WorkerPool::new(
            self.config.worker_count,
            WorkerContext {
                queue: self.queue.clone(),
                store: self.store.clone(),
                workload: self.workload.clone(),
                delivery: self.delivery.clone(),
                deliveries: self.deliveries.clone(),
                busy: self.busy.clone(),
                clock: self.clock.clone(),
            },
        );
        pool.spawn_workers();
        *workers = Some(pool);
        info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.queue.capacity(),
            "pipeline started"
        );
    }

    /// Runs the work inline on the caller's task and returns the result.
    ///
    /// This path never touches the queue or the workers: the caller is
    /// occupied for the full duration of the computation.
    ///
    /// # Errors
    ///
    /// - `Validation` for out-of-bounds input or iterations
    /// - `WorkFailure` if the computation fails; the task is recorded failed
    /// - `Storage` if the task cannot be persisted
    #[instrument(skip(self, input), fields(input_len = input.len()))]
    pub async fn submit_sync(&self, input: String, iterations: Option<u32>) -> Result<SyncResult> {
        self.ensure_accepting()?;
        let iterations = self.validate(&input, iterations)?;

        let store = self.store.as_ref();
        let clock = self.clock.as_ref();
        let task = Task::new_sync(input, iterations, clock.now_utc());
        let task_id = store.create_task(task.clone()).await?;

        let running = StatusUpdate::running(clock.now_utc());
        if let Err(e) = record_status(store, clock, task_id, &running).await {
            self.fail_sync(task_id, format!("task could not be started: {e}")).await;
            return Err(e.into());
        }

        match self.workload.run(&task.input, iterations) {
            Ok(output) => {
                let update = StatusUpdate::succeeded(
                    output.result.clone(),
                    output.duration_ms,
                    clock.now_utc(),
                );
                if let Err(e) = record_status(store, clock, task_id, &update).await {
                    self.fail_sync(task_id, format!("task result could not be recorded: {e}"))
                        .await;
                    return Err(e.into());
                }
                debug!(task_id = %task_id, duration_ms = output.duration_ms, "sync task succeeded");
                Ok(SyncResult {
                    task_id,
                    result: output.result,
                    iterations: output.iterations,
                    duration_ms: output.duration_ms,
                })
            },
            Err(e) => {
                let message = e.to_string();
                let update = StatusUpdate::failed(message.clone(), None, clock.now_utc());
                record_status(store, clock, task_id, &update).await?;
                warn!(task_id = %task_id, error = %message, "sync task failed");
                Err(PipelineError::WorkFailure { task_id, message })
            },
        }
    }

    /// Validates and queues a task whose result is posted to `callback_url`.
    ///
    /// Returns as soon as the task is persisted and queued; it never waits
    /// for queue capacity.
    ///
    /// # Errors
    ///
    /// - `Validation` for out-of-bounds input, iterations, or URL shape
    /// - `SsrfRejected` if the callback URL is unsafe
    /// - `Backpressure` if the queue is full
    /// - `ShuttingDown` after shutdown began
    /// - `Storage` if the task cannot be persisted
    ///
    /// No task is persisted on any error path.
    #[instrument(skip(self, input, callback_url), fields(input_len = input.len()))]
    pub async fn submit_async(
        &self,
        input: String,
        iterations: Option<u32>,
        callback_url: String,
    ) -> Result<Accepted> {
        self.ensure_accepting()?;
        let iterations = self.validate(&input, iterations)?;

        if let Err(reason) = self.guard.check(&callback_url).await {
            info!(reason = reason.code(), "callback URL rejected at admission");
            return Err(reason.into());
        }

        let task = Task::new_async(input, iterations, callback_url, self.clock.now_utc());
        let task_id = self.queue.submit(task, self.store.as_ref()).await?;
        debug!(task_id = %task_id, queue_depth = self.queue.depth(), "async task accepted");
        Ok(Accepted { task_id })
    }

    /// Current load and liveness.
    pub async fn health(&self) -> Health {
        let store_healthy = match self.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store health check failed");
                false
            },
        };
        Health {
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            active_workers: self.busy.load(Ordering::Acquire),
            worker_count: self.config.worker_count,
            accepting: self.accepting.load(Ordering::Acquire),
            store_healthy,
            delivery: self.delivery.stats().await,
        }
    }

    /// Fetches a task.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store fails.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.store.get_task(id).await?)
    }

    /// Fetches a task's delivery trace.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store fails.
    pub async fn delivery_trace(&self, id: TaskId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.store.delivery_trace(id).await?)
    }

    /// Lists tasks newest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store fails.
    pub async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter, page).await?)
    }

    /// Fails async tasks left `pending` or `running` that nothing will
    /// ever pick up again, and returns how many were recorded.
    ///
    /// Only sound while no task is queued or executing: before the pipeline
    /// starts, or once workers have stopped and the queue is drained. The
    /// binary runs it at startup to clean up after a process that died
    /// mid-task.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if unfinished tasks cannot be listed.
    pub async fn reconcile_unfinished(&self) -> Result<usize> {
        let mut stranded = Vec::new();
        for status in [TaskStatus::Pending, TaskStatus::Running] {
            let filter = TaskFilter { mode: Some(TaskMode::Async), status: Some(status) };
            let mut offset = 0;
            loop {
                let page = Page { limit: RECONCILE_PAGE_SIZE, offset };
                let rows = self.store.list_tasks(filter, page).await?;
                let fetched = rows.len();
                stranded.extend(rows.into_iter().map(|task| task.id));
                if fetched < RECONCILE_PAGE_SIZE as usize {
                    break;
                }
                offset += RECONCILE_PAGE_SIZE;
            }
        }

        let mut reconciled = 0;
        for id in stranded {
            let update =
                StatusUpdate::failed(INTERRUPTED_BEFORE_COMPLETION, None, self.clock.now_utc());
            if record_failure(self.store.as_ref(), self.clock.as_ref(), id, &update).await {
                reconciled += 1;
            }
        }
        if reconciled > 0 {
            warn!(count = reconciled, "failed unfinished tasks with nothing left to run them");
        }
        Ok(reconciled)
    }

    /// Stops the pipeline.
    ///
    /// 1. New submissions are refused with `ShuttingDown`.
    /// 2. Workers finish their in-flight task and exit.
    /// 3. Tasks still queued are marked failed with
    ///    [`ABANDONED_BEFORE_EXECUTION`].
    /// 4. If every worker stopped, async tasks still unfinished are marked
    ///    failed with [`INTERRUPTED_BEFORE_COMPLETION`].
    /// 5. Delivery sequences waiting to retry record an `abandoned` trace
    ///    entry and stop; an attempt already in progress runs to completion.
    ///
    /// Waiting for workers and deliveries is bounded by the configured
    /// shutdown timeout. Missing the deadline does not skip later steps;
    /// it is reported in the returned [`ShutdownReport`].
    pub async fn shutdown(&self) -> ShutdownReport {
        let timeout = self.config.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        info!(timeout_seconds = timeout.as_secs(), "pipeline shutting down");

        self.accepting.store(false, Ordering::Release);
        self.queue.close();

        let mut report = ShutdownReport { workers_stopped: true, ..Default::default() };
        if let Some(pool) = self.workers.lock().await.take() {
            if let Err(e) = pool.shutdown_graceful(remaining(deadline)).await {
                warn!(error = %e, "continuing shutdown with workers still running");
                report.workers_stopped = false;
            }
        }

        match tokio::time::timeout_at(grace_deadline(deadline), self.queue.drain()).await {
            Ok(leftover) => {
                for task in leftover {
                    let update =
                        StatusUpdate::failed(ABANDONED_BEFORE_EXECUTION, None, self.clock.now_utc());
                    if record_failure(self.store.as_ref(), self.clock.as_ref(), task.id, &update)
                        .await
                    {
                        report.abandoned_tasks += 1;
                    }
                }
            },
            Err(_) => error!("queue drain timed out; queued tasks are left for reconciliation"),
        }

        if report.workers_stopped {
            report.interrupted_tasks = self.reconcile_unfinished().await.unwrap_or_else(|e| {
                error!(error = %e, "failed to reconcile unfinished tasks");
                0
            });
        }

        self.delivery.abandon_pending_retries();
        self.deliveries.close();
        report.deliveries_settled =
            tokio::time::timeout_at(grace_deadline(deadline), self.deliveries.wait()).await.is_ok();
        if !report.deliveries_settled {
            warn!(
                remaining = self.deliveries.len(),
                "delivery sequences still running at shutdown deadline"
            );
        }

        info!(
            workers_stopped = report.workers_stopped,
            abandoned_tasks = report.abandoned_tasks,
            interrupted_tasks = report.interrupted_tasks,
            deliveries_settled = report.deliveries_settled,
            "pipeline shutdown complete"
        );
        report
    }

    async fn fail_sync(&self, task_id: TaskId, message: String) {
        let update = StatusUpdate::failed(message, None, self.clock.now_utc());
        record_failure(self.store.as_ref(), self.clock.as_ref(), task_id, &update).await;
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PipelineError::ShuttingDown)
        }
    }

    fn validate(&self, input: &str, iterations: Option<u32>) -> Result<u32> {
        let length = input.chars().count();
        if length == 0 {
            return Err(PipelineError::validation("input must not be empty"));
        }
        if length > self.config.max_input_length {
            return Err(PipelineError::validation(format!(
                "input length {length} exceeds maximum of {}",
                self.config.max_input_length
            )));
        }

        let iterations = iterations.unwrap_or(self.config.default_iterations);
        if iterations == 0 || iterations > self.config.max_iterations {
            return Err(PipelineError::validation(format!(
                "iterations must be between 1 and {}",
                self.config.max_iterations
            )));
        }
        Ok(iterations)
    }
}

fn remaining(deadline: tokio::time::Instant) -> Duration {
    deadline.saturating_duration_since(tokio::time::Instant::now())
}

fn grace_deadline(deadline: tokio::time::Instant) -> tokio::time::Instant {
    deadline.max(tokio::time::Instant::now() + SETTLE_GRACE)
}

#[cfg(test)]
mod tests {
    use offload_core::{MemoryTaskStore, TestClock, WorkError, WorkOutput, WRITE_ATTEMPTS};

    use super::*;

    #[derive(Debug)]
    struct FailingWorkload;

    impl Workload for FailingWorkload {
        fn run(&self, _input: &str, _iterations: u32) -> std::result::Result<WorkOutput, WorkError> {
            Err(WorkError::Failed("boom".into()))
        }
    }

    fn pipeline(store: Arc<MemoryTaskStore>) -> Pipeline {
        Pipeline::builder(store, PipelineConfig::default()).build().unwrap()
    }

    #[tokio::test]
    async fn sync_path_persists_result() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = pipeline(store.clone());

        let result = pipeline.submit_sync("hello".into(), Some(1)).await.unwrap();
        assert_eq!(
            result.result,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let task = store.get_task(result.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result, Some(result.result));
        assert!(task.callback_status.is_none());
    }

    #[tokio::test]
    async fn sync_work_failure_is_recorded_and_returned() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = Pipeline::builder(store.clone(), PipelineConfig::default())
            .workload(Arc::new(FailingWorkload))
            .build()
            .unwrap();

        let err = pipeline.submit_sync("hello".into(), None).await.unwrap_err();
        let PipelineError::WorkFailure { task_id, message } = err else {
            panic!("expected work failure, got {err:?}");
        };
        assert!(message.contains("boom"));

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(message.as_str()));
    }

    #[tokio::test]
    async fn validation_rejects_without_side_effects() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = pipeline(store.clone());

        let cases = [
            (String::new(), Some(10)),
            ("x".repeat(10_001), Some(10)),
            ("ok".to_string(), Some(0)),
            ("ok".to_string(), Some(1_000_001)),
        ];
        for (input, iterations) in cases {
            let err = pipeline
                .submit_async(input, iterations, "https://example.com/cb".into())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        assert_eq!(store.task_count().await, 0);
    }

    #[tokio::test]
    async fn metadata_callback_is_rejected_before_persisting() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = pipeline(store.clone());

        let err = pipeline
            .submit_async("hello".into(), Some(1000), "http://169.254.169.254/latest/meta-data/".into())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SsrfRejected(_)));
        assert_eq!(store.task_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = pipeline(store);
        pipeline.start().await;

        let report = pipeline.shutdown().await;
        assert!(report.workers_stopped);
        assert_eq!(report.abandoned_tasks, 0);
        assert_eq!(report.interrupted_tasks, 0);
        assert!(report.deliveries_settled);

        assert!(matches!(
            pipeline.submit_sync("x".into(), Some(1)).await,
            Err(PipelineError::ShuttingDown)
        ));
        assert!(!pipeline.health().await.accepting);
    }

    #[tokio::test]
    async fn sync_task_is_failed_when_running_cannot_be_recorded() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = Pipeline::builder(store.clone(), PipelineConfig::default())
            .clock(Arc::new(TestClock::new()))
            .build()
            .unwrap();
        store.inject_write_errors_after(1, "disk full", WRITE_ATTEMPTS as usize).await;

        let err = pipeline.submit_sync("hello".into(), Some(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        let tasks = store.list_tasks(TaskFilter::default(), Page::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.as_deref().unwrap().starts_with("task could not be started"));
    }

    #[tokio::test]
    async fn sync_path_rides_out_a_transient_store_failure() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = Pipeline::builder(store.clone(), PipelineConfig::default())
            .clock(Arc::new(TestClock::new()))
            .build()
            .unwrap();
        store.inject_write_errors_after(1, "database is locked", 1).await;

        let result = pipeline.submit_sync("hello".into(), Some(1)).await.unwrap();

        let task = store.get_task(result.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn reconcile_fails_only_unfinished_async_tasks() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = pipeline(store.clone());
        let now = chrono::Utc::now();

        let pending = Task::new_async("a", 1, "https://example.com/cb", now);
        let running = Task::new_async("b", 1, "https://example.com/cb", now);
        let inline = Task::new_sync("c", 1, now);
        for task in [&pending, &running, &inline] {
            store.create_task(task.clone()).await.unwrap();
        }
        store.update_task_status(running.id, StatusUpdate::running(now)).await.unwrap();
        store.update_task_status(inline.id, StatusUpdate::running(now)).await.unwrap();

        assert_eq!(pipeline.reconcile_unfinished().await.unwrap(), 2);

        for id in [pending.id, running.id] {
            let task = store.get_task(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some(INTERRUPTED_BEFORE_COMPLETION));
        }
        let task = store.get_task(inline.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        assert_eq!(pipeline.reconcile_unfinished().await.unwrap(), 0);
    }
}
