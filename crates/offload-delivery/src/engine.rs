//! Callback delivery engine.
//!
//! Runs once per completed async task:
//!
//! ```text
//! ┌───────────────┐  unsafe   ┌──────────────────────────┐
//! │ re-validate   │──────────▶│ trace: rejected, stop    │
//! └──────┬────────┘           └──────────────────────────┘
//!        ▼
//! ┌───────────────┐  2xx      ┌──────────────────────────┐
//! │ POST callback │──────────▶│ trace: delivered, stop   │
//! └──────┬────────┘           └──────────────────────────┘
//!        ▼ failure
//! ┌───────────────┐  last     ┌──────────────────────────┐
//! │ trace: failed │──────────▶│ delivery failed, stop    │
//! └──────┬────────┘           └──────────────────────────┘
//!        ▼ backoff (cancellable)
//!   next attempt, or trace: abandoned on shutdown
//! ```
//!
//! Every trace entry is written before the engine sleeps or returns, so the
//! trace stays complete if the process dies mid-sequence. Store writes retry
//! transient failures; a sequence whose trace still cannot be written settles
//! its delivery summary as failed before returning the error. Task status is
//! never touched here; delivery has its own summary on the task record.

use std::{sync::Arc, time::Duration};

use offload_core::{
    with_write_retries, AttemptOutcome, CallbackStatus, Clock, DeliveryAttempt, Task, TaskId,
    TaskStore,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{CallbackPayload, DeliveryClient},
    error::Result,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    url_guard::{UnsafeReason, UrlGuard},
};

/// Work item handed from a worker to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    /// Task being reported.
    pub task_id: TaskId,
    /// Destination accepted at admission.
    pub callback_url: String,
    /// Body to post.
    pub payload: CallbackPayload,
}

impl DeliveryJob {
    /// Builds a job from a terminal async task; `None` for tasks without a
    /// callback URL.
    pub fn from_task(task: &Task) -> Option<Self> {
        let callback_url = task.callback_url.clone()?;
        Some(Self {
            task_id: task.id,
            callback_url,
            payload: CallbackPayload {
                task_id: task.id,
                status: task.status,
                result: task.result.clone(),
                error: task.error.clone(),
                iterations: task.iterations,
                duration_ms: task.duration_ms,
                timestamp: task.completed_at.unwrap_or(task.submitted_at),
            },
        })
    }
}

/// How a delivery sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Endpoint accepted the callback.
    Delivered {
        /// Attempts made, including the successful one
        attempts: u32,
    },
    /// URL failed re-validation; no request was sent for this attempt.
    Rejected {
        /// Validation failure
        reason: UnsafeReason,
        /// Trace entries written
        attempts: u32,
    },
    /// Every allowed attempt failed.
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
    /// Shutdown interrupted the backoff before the next attempt.
    Abandoned {
        /// Attempts made before abandonment
        attempts: u32,
    },
}

/// Counters for monitoring delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Sequences currently running.
    pub in_flight: u64,
    /// Sequences that ended delivered.
    pub delivered: u64,
    /// Individual failed attempts.
    pub failed_attempts: u64,
    /// Sequences that exhausted retries.
    pub exhausted: u64,
    /// Sequences rejected at delivery-time validation.
    pub rejected: u64,
    /// Sequences abandoned at shutdown.
    pub abandoned: u64,
}

/// Delivers callbacks with re-validation, retry, and a persisted trace.
#[derive(Clone)]
pub struct CallbackDelivery {
    store: Arc<dyn TaskStore>,
    guard: UrlGuard,
    client: DeliveryClient,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    stats: Arc<RwLock<DeliveryStats>>,
}

impl CallbackDelivery {
    /// Creates an engine.
    pub fn new(
        store: Arc<dyn TaskStore>,
        guard: UrlGuard,
        client: DeliveryClient,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            guard,
            client,
            policy,
            clock,
            cancellation_token: CancellationToken::new(),
            stats: Arc::new(RwLock::new(DeliveryStats::default())),
        }
    }

    /// Returns the retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Interrupts every pending backoff. Sequences waiting to retry record an
    /// `abandoned` entry and stop; an attempt already on the wire finishes.
    pub fn abandon_pending_retries(&self) {
        self.cancellation_token.cancel();
    }

    /// Whether retries have been abandoned.
    pub fn is_abandoning(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Returns a snapshot of the counters.
    pub async fn stats(&self) -> DeliveryStats {
        self.stats.read().await.clone()
    }

    /// Runs the full delivery sequence for one task.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if a trace entry or the delivery
    /// summary cannot be persisted after retries. The summary is then settled
    /// as failed if it is still pending. Delivery failures themselves are not
    /// errors; they are reported through the outcome and the trace.
    pub async fn deliver(&self, job: DeliveryJob) -> Result<DeliveryOutcome> {
        self.stats.write().await.in_flight += 1;
        let outcome = self.run(&job).await;
        if let Err(e) = &outcome {
            error!(task_id = %job.task_id, error = %e, "delivery sequence aborted by storage failure");
            let message = format!("delivery aborted: {e}");
            if let Err(settle_error) =
                self.settle(job.task_id, CallbackStatus::Failed, Some(message)).await
            {
                debug!(task_id = %job.task_id, error = %settle_error, "delivery summary left as is");
            }
        }
        {
            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            match &outcome {
                Ok(DeliveryOutcome::Delivered { .. }) => stats.delivered += 1,
                Ok(DeliveryOutcome::Rejected { .. }) => stats.rejected += 1,
                Ok(DeliveryOutcome::Exhausted { .. }) => stats.exhausted += 1,
                Ok(DeliveryOutcome::Abandoned { .. }) => stats.abandoned += 1,
                Err(_) => {},
            }
        }
        outcome
    }

    async fn run(&self, job: &DeliveryJob) -> Result<DeliveryOutcome> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempted_at = self.clock.now_utc();
            let started = self.clock.now();

            let target = match self.guard.check(&job.callback_url).await {
                Ok(target) => target,
                Err(reason) => {
                    warn!(
                        task_id = %job.task_id,
                        attempt,
                        reason = reason.code(),
                        "callback URL rejected at delivery time"
                    );
                    let message = format!("{}: {reason}", reason.code());
                    let recorded = self
                        .record(DeliveryAttempt {
                            task_id: job.task_id,
                            attempt_number: attempt,
                            attempted_at,
                            outcome: AttemptOutcome::Rejected,
                            status_code: None,
                            error: Some(message.clone()),
                            duration_ms: self.elapsed_ms(started),
                            next_retry_at: None,
                        })
                        .await;
                    self.settle(job.task_id, CallbackStatus::Failed, Some(message)).await?;
                    recorded?;
                    return Ok(DeliveryOutcome::Rejected { reason, attempts: attempt });
                },
            };

            match self.client.send(&target, &job.payload, attempt).await {
                Ok(response) => {
                    // The endpoint has the callback; settle even if the
                    // trace entry could not be written.
                    let recorded = self
                        .record(DeliveryAttempt {
                            task_id: job.task_id,
                            attempt_number: attempt,
                            attempted_at,
                            outcome: AttemptOutcome::Delivered,
                            status_code: Some(response.status_code),
                            error: None,
                            duration_ms: self.elapsed_ms(started),
                            next_retry_at: None,
                        })
                        .await;
                    self.settle(job.task_id, CallbackStatus::Delivered, None).await?;
                    recorded?;
                    info!(
                        task_id = %job.task_id,
                        attempt,
                        status_code = response.status_code,
                        "callback delivered"
                    );
                    return Ok(DeliveryOutcome::Delivered { attempts: attempt });
                },
                Err(error) => {
                    self.stats.write().await.failed_attempts += 1;
                    let decision =
                        RetryContext::new(attempt, &error, self.clock.now_utc(), &self.policy)
                            .decide_retry();
                    let next_retry_at = match &decision {
                        RetryDecision::Retry { next_attempt_at, .. } => Some(*next_attempt_at),
                        RetryDecision::GiveUp { .. } => None,
                    };

                    let recorded = self
                        .record(DeliveryAttempt {
                            task_id: job.task_id,
                            attempt_number: attempt,
                            attempted_at,
                            outcome: AttemptOutcome::Failed,
                            status_code: error.status_code(),
                            error: Some(error.trace_message()),
                            duration_ms: self.elapsed_ms(started),
                            next_retry_at,
                        })
                        .await;

                    match decision {
                        RetryDecision::GiveUp { reason } => {
                            warn!(task_id = %job.task_id, attempt, %reason, "callback delivery failed");
                            self.settle(job.task_id, CallbackStatus::Failed, Some(reason)).await?;
                            recorded?;
                            return Ok(DeliveryOutcome::Exhausted { attempts: attempt });
                        },
                        RetryDecision::Retry { delay, .. } => {
                            // Numbering must stay gapless, so a missing entry
                            // ends the sequence.
                            recorded?;
                            debug!(
                                task_id = %job.task_id,
                                attempt,
                                error = %error,
                                delay_ms = delay.as_millis(),
                                "callback attempt failed, retrying"
                            );
                            if !self.backoff(delay).await {
                                return self.abandon(job.task_id, attempt).await;
                            }
                        },
                    }
                },
            }
        }
    }

    /// Sleeps for `delay`; returns `false` if interrupted by shutdown.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => false,
            () = self.clock.sleep(delay) => true,
        }
    }

    async fn abandon(&self, task_id: TaskId, attempts: u32) -> Result<DeliveryOutcome> {
        info!(task_id = %task_id, attempts, "abandoning pending callback retry at shutdown");
        let recorded = self
            .record(DeliveryAttempt {
                task_id,
                attempt_number: attempts + 1,
                attempted_at: self.clock.now_utc(),
                outcome: AttemptOutcome::Abandoned,
                status_code: None,
                error: Some("abandoned: shutdown before retry".to_string()),
                duration_ms: 0,
                next_retry_at: None,
            })
            .await;
        self.settle(
            task_id,
            CallbackStatus::Abandoned,
            Some(format!("abandoned at shutdown after {attempts} attempts")),
        )
        .await?;
        recorded?;
        Ok(DeliveryOutcome::Abandoned { attempts })
    }

    async fn record(&self, attempt: DeliveryAttempt) -> Result<()> {
        with_write_retries(self.clock.as_ref(), "append_delivery_attempt", || {
            self.store.append_delivery_attempt(attempt.clone())
        })
        .await?;
        Ok(())
    }

    async fn settle(
        &self,
        task_id: TaskId,
        status: CallbackStatus,
        error: Option<String>,
    ) -> Result<()> {
        with_write_retries(self.clock.as_ref(), "update_delivery_status", || {
            self.store.update_delivery_status(task_id, status, error.clone())
        })
        .await?;
        Ok(())
    }

    fn elapsed_ms(&self, started: std::time::Instant) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(started);
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}
