//! Fixed-size worker pool with supervised shutdown.
//!
//! Worker count is set at construction and never changes. Each worker runs
//! as its own tokio task; CPU-bound work inside a worker runs on the blocking
//! thread pool so request handling is never starved.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{PipelineError, Result},
    worker::{TaskWorker, WorkerContext},
};

/// Pool of task workers sharing one queue.
pub(crate) struct WorkerPool {
    worker_count: usize,
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize, ctx: WorkerContext) -> Self {
        Self {
            worker_count,
            ctx,
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Spawns every worker and returns immediately.
    pub(crate) fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning task workers");

        for worker_id in 0..self.worker_count {
            let worker =
                TaskWorker::new(worker_id, self.ctx.clone(), self.cancellation_token.clone());

            let handle = tokio::spawn(async move {
                info!(worker_id, "task worker starting");

                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "task worker terminated with error");
                } else {
                    info!(worker_id, "task worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Number of workers spawned and not yet finished.
    pub(crate) fn live_workers(&self) -> usize {
        self.worker_handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Signals every worker to stop after its in-flight task and waits for
    /// them, up to `timeout`.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        let shutdown_future = async {
            let mut panicked = 0usize;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                        panicked += 1;
                    },
                }
            }
            panicked
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(PipelineError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.live_workers();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(active_workers = active, "worker pool dropped with active workers, cancelling them");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Arc};

    use offload_core::{MemoryTaskStore, RealClock, Sha256Workload};
    use offload_delivery::{CallbackDelivery, DeliveryClient, GuardConfig, RetryPolicy, UrlGuard};
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::queue::TaskQueue;

    fn context() -> WorkerContext {
        let store = Arc::new(MemoryTaskStore::new());
        let clock = Arc::new(RealClock::new());
        WorkerContext {
            queue: Arc::new(TaskQueue::new(4, 5)),
            store: store.clone(),
            workload: Arc::new(Sha256Workload),
            delivery: CallbackDelivery::new(
                store,
                UrlGuard::new(GuardConfig::default()),
                DeliveryClient::with_defaults().unwrap(),
                RetryPolicy::default(),
                clock.clone(),
            ),
            deliveries: TaskTracker::new(),
            busy: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }

    #[tokio::test]
    async fn spawns_configured_number_of_workers() {
        let mut pool = WorkerPool::new(3, context());
        pool.spawn_workers();
        assert_eq!(pool.worker_handles.len(), 3);
        assert_eq!(pool.live_workers(), 3);

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn idle_workers_stop_promptly() {
        let mut pool = WorkerPool::new(2, context());
        pool.spawn_workers();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        pool.shutdown_graceful(Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn shutdown_without_workers_succeeds() {
        let pool = WorkerPool::new(2, context());
        assert!(pool.shutdown_graceful(Duration::from_millis(1)).await.is_ok());
    }
}
