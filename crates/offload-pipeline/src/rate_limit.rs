//! Sliding-window rate limiter keyed by client identity.
//!
//! Each key keeps the instants of its admitted requests inside the trailing
//! window. A request is admitted while fewer than `max_requests` instants
//! fall in `(now - window, now]`, so bursts straddling a window boundary
//! cannot exceed the limit the way fixed buckets allow.
//!
//! Keys whose window has emptied are dropped on their next check and by
//! [`SlidingWindowLimiter::sweep`], which the service runs periodically.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use offload_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per key within one window.
    pub max_requests: u32,
    /// Length of the trailing window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 500, window: Duration::from_secs(60) }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request admitted and recorded.
    Allowed {
        /// Requests still available in the current window
        remaining: u32,
    },
    /// Request refused.
    Denied {
        /// Whole seconds until the oldest request leaves the window, at
        /// least 1
        retry_after_seconds: u64,
    },
}

impl Admission {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Per-key sliding-window limiter, shared by all request handlers.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter reading time from `clock`.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, windows: Mutex::new(HashMap::new()) }
    }

    /// Returns the limiter settings.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Checks and records one request for `key`.
    pub fn admit(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let mut windows = self.lock();

        let window = windows.entry(key.to_owned()).or_default();
        self.prune(window, now);

        let used = u32::try_from(window.len()).unwrap_or(u32::MAX);
        if used < self.config.max_requests {
            window.push_back(now);
            return Admission::Allowed { remaining: self.config.max_requests - used - 1 };
        }

        let retry_after_seconds = match window.front() {
            Some(oldest) => {
                let expires = *oldest + self.config.window;
                ceil_secs(expires.saturating_duration_since(now)).max(1)
            },
            // Only reachable with a limit of zero.
            None => ceil_secs(self.config.window).max(1),
        };
        if window.is_empty() {
            windows.remove(key);
        }
        debug!(key, retry_after_seconds, "rate limit exceeded");
        Admission::Denied { retry_after_seconds }
    }

    /// Drops keys with no requests inside the window. Returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            self.prune(window, now);
            !window.is_empty()
        });
        before - windows.len()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    /// Runs [`sweep`](Self::sweep) once per window until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = self.clock.sleep(self.config.window) => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.tracked_keys(), "swept stale rate limit keys");
                        }
                    },
                }
            }
            info!("rate limit sweeper stopped");
        })
    }

    fn prune(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.config.window)
        {
            window.pop_front();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use offload_core::TestClock;

    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> (SlidingWindowLimiter, TestClock) {
        let clock = TestClock::new();
        let limiter = SlidingWindowLimiter::new(
            RateLimitConfig { max_requests, window: Duration::from_secs(window_secs) },
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[test]
    fn admits_up_to_limit_then_denies() {
        let (limiter, _clock) = limiter(3, 60);

        assert_eq!(limiter.admit("a"), Admission::Allowed { remaining: 2 });
        assert_eq!(limiter.admit("a"), Admission::Allowed { remaining: 1 });
        assert_eq!(limiter.admit("a"), Admission::Allowed { remaining: 0 });
        assert_eq!(limiter.admit("a"), Admission::Denied { retry_after_seconds: 60 });
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _clock) = limiter(1, 60);
        assert!(limiter.admit("a").is_allowed());
        assert!(!limiter.admit("a").is_allowed());
        assert!(limiter.admit("b").is_allowed());
    }

    #[test]
    fn retry_after_counts_down_to_oldest_expiry() {
        let (limiter, clock) = limiter(2, 60);

        limiter.admit("a");
        clock.advance(Duration::from_secs(20));
        limiter.admit("a");
        clock.advance(Duration::from_millis(15_500));

        // Oldest entry expires 60s after it was recorded: 24.5s from now.
        assert_eq!(limiter.admit("a"), Admission::Denied { retry_after_seconds: 25 });
    }

    #[test]
    fn window_slides_instead_of_resetting() {
        let (limiter, clock) = limiter(2, 10);

        limiter.admit("a");
        clock.advance(Duration::from_secs(9));
        limiter.admit("a");

        // First request leaves the window; the second still counts.
        clock.advance(Duration::from_secs(2));
        assert!(limiter.admit("a").is_allowed());
        assert!(!limiter.admit("a").is_allowed());

        clock.advance(Duration::from_secs(10));
        assert!(limiter.admit("a").is_allowed());
    }

    #[test]
    fn boundary_burst_is_limited() {
        let (limiter, clock) = limiter(5, 60);

        clock.advance(Duration::from_secs(59));
        for _ in 0..5 {
            assert!(limiter.admit("a").is_allowed());
        }
        clock.advance(Duration::from_secs(2));
        assert!(!limiter.admit("a").is_allowed());
    }

    #[test]
    fn sweep_drops_stale_keys() {
        let (limiter, clock) = limiter(5, 30);

        limiter.admit("a");
        limiter.admit("b");
        clock.advance(Duration::from_secs(20));
        limiter.admit("b");
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(Duration::from_secs(15));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 1);

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let (limiter, _clock) = limiter(5, 30);
        let limiter = Arc::new(limiter);
        limiter.admit("a");

        let shutdown = CancellationToken::new();
        let handle = limiter.clone().spawn_sweeper(shutdown.clone());
        tokio::task::yield_now().await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
