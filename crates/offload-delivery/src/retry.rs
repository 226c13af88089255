//! Exponential backoff retry policy with jitter.
//!
//! With the default policy a callback is attempted up to five times, waiting
//! roughly 2s, 4s, 8s, and 16s between attempts. Each wait is randomized by
//! ±25% so that many tasks failing against the same endpoint do not retry in
//! lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for callback delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically.
    pub jitter_factor: f64,

    /// Strategy for growing the delay.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// Delay doubles each attempt.
    Exponential,
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempt` (1-based), before
    /// jitter.
    pub fn base_delay_for(&self, failed_attempt: u32) -> Duration {
        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exponent = failed_attempt.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };
        raw.min(self.max_delay)
    }

    /// Jittered delay before the attempt following `failed_attempt`.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        apply_jitter(self.base_delay_for(failed_attempt), self.jitter_factor).min(self.max_delay)
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: &'a DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: &'a RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then attempt again.
    Retry {
        /// How long to wait
        delay: Duration,
        /// When the next attempt is due
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying.
    GiveUp {
        /// Why no further attempt will be made
        reason: String,
    },
}

impl<'a> RetryContext<'a> {
    /// Creates a new retry context.
    pub fn new(
        attempt_number: u32,
        error: &'a DeliveryError,
        failed_at: DateTime<Utc>,
        policy: &'a RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("All {} attempts failed", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {}", self.error) };
        }

        let delay = self.policy.delay_for(self.attempt_number);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { delay, next_attempt_at: self.failed_at + chrono_delay }
    }
}

/// Randomizes a delay by ±`jitter_factor`.
///
/// With a factor of 0.25 a 8s delay becomes anything from 6s to 10s.
pub fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let factor = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * factor;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = no_jitter();
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(32),
            ]
        );
    }

    #[test]
    fn delay_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn fixed_strategy_never_grows() {
        let policy = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..no_jitter() };
        assert_eq!(policy.delay_for(1), policy.delay_for(4));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(8);
        for _ in 0..200 {
            let jittered = apply_jitter(base, 0.25);
            assert!(jittered >= Duration::from_secs(6), "{jittered:?}");
            assert!(jittered <= Duration::from_secs(10), "{jittered:?}");
        }
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy::default();
        let error = DeliveryError::timeout(10);
        let decision = RetryContext::new(5, &error, Utc::now(), &policy).decide_retry();
        assert_eq!(decision, RetryDecision::GiveUp { reason: "All 5 attempts failed".into() });
    }

    #[test]
    fn retry_schedules_next_attempt() {
        let policy = no_jitter();
        let error = DeliveryError::http_status(503, "");
        let failed_at = Utc::now();

        match RetryContext::new(2, &error, failed_at, &policy).decide_retry() {
            RetryDecision::Retry { delay, next_attempt_at } => {
                assert_eq!(delay, Duration::from_secs(4));
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(4));
            },
            RetryDecision::GiveUp { reason } => panic!("unexpected give up: {reason}"),
        }
    }

    #[test]
    fn non_retryable_error_gives_up() {
        let policy = RetryPolicy::default();
        let error = DeliveryError::storage("locked");
        let decision = RetryContext::new(1, &error, Utc::now(), &policy).decide_retry();
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }
}
