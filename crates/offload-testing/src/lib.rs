//! Shared test environment for offload crates.
//!
//! Every [`TestEnv`] owns an isolated in-memory SQLite store, a
//! deterministic clock, and a wiremock server standing in for callback
//! receivers. Pipelines built from it accept loopback callback URLs so the
//! mock server is reachable.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
pub use offload_core::TestClock;
use offload_core::{DeliveryAttempt, SqliteTaskStore, Task, TaskId, TaskStore, Workload};
use offload_delivery::{ClientConfig, GuardConfig, RetryPolicy};
use offload_pipeline::{Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;
pub use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Isolated environment for pipeline and API tests.
pub struct TestEnv {
    /// Store shared by everything built from this environment
    pub store: Arc<SqliteTaskStore>,
    /// Deterministic clock; delivery backoff completes instantly
    pub clock: TestClock,
    /// Mock callback receiver
    pub callback_server: MockServer,
}

impl TestEnv {
    /// Creates a fresh environment.
    ///
    /// # Errors
    ///
    /// Returns error if the in-memory database cannot be created.
    pub async fn new() -> Result<Self> {
        init_test_tracing();
        let store = SqliteTaskStore::in_memory().await.context("in-memory task store")?;
        Ok(Self {
            store: Arc::new(store),
            clock: TestClock::new(),
            callback_server: MockServer::start().await,
        })
    }

    /// URL on the mock receiver.
    pub fn callback_url(&self, path: &str) -> String {
        format!("{}{path}", self.callback_server.uri())
    }

    /// Mounts a receiver answering every POST to `path` with `status`.
    pub async fn respond_to_callbacks(&self, path: &str, status: u16) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path(path))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.callback_server)
            .await;
    }

    /// Small pipeline configuration that allows loopback callbacks.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            default_iterations: 100,
            worker_count: 2,
            queue_capacity: 16,
            shutdown_timeout: Duration::from_secs(5),
            guard: GuardConfig { max_url_length: 2048, allow_private: true },
            client: ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() },
            retry: RetryPolicy::default(),
            ..PipelineConfig::default()
        }
    }

    /// Builds a pipeline over this environment's store and clock. Workers
    /// are not started.
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline cannot be assembled.
    pub fn pipeline(&self, config: PipelineConfig) -> Result<Arc<Pipeline>> {
        self.pipeline_with_workload(config, None)
    }

    /// Like [`pipeline`](Self::pipeline) with a custom work function.
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline cannot be assembled.
    pub fn pipeline_with_workload(
        &self,
        config: PipelineConfig,
        workload: Option<Arc<dyn Workload>>,
    ) -> Result<Arc<Pipeline>> {
        let mut builder =
            Pipeline::builder(self.store.clone(), config).clock(Arc::new(self.clock.clone()));
        if let Some(workload) = workload {
            builder = builder.workload(workload);
        }
        Ok(Arc::new(builder.build()?))
    }

    /// Polls until `done` holds for the task, or fails after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns error on timeout, store failure, or a missing task.
    pub async fn wait_for_task<F>(&self, id: TaskId, timeout: Duration, done: F) -> Result<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self
                .store
                .get_task(id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            if done(&task) {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("task {id} did not reach expected state within {timeout:?}: {task:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until the task's delivery summary has settled.
    ///
    /// # Errors
    ///
    /// Returns error on timeout or store failure.
    pub async fn wait_for_delivery(&self, id: TaskId, timeout: Duration) -> Result<Task> {
        self.wait_for_task(id, timeout, |task| {
            task.callback_status.is_some_and(|status| status.is_settled())
        })
        .await
    }

    /// Reads a task's delivery trace.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    pub async fn trace(&self, id: TaskId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.store.delivery_trace(id).await?)
    }
}
