//! Configuration for the offload service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use offload_delivery::{BackoffStrategy, ClientConfig, GuardConfig, RetryPolicy};
use offload_pipeline::{PipelineConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "offload.toml";
const ENV_PREFIX: &str = "OFFLOAD_";

/// Service configuration with defaults, file, and environment overrides.
///
/// Sources in priority order:
/// 1. Environment variables prefixed `OFFLOAD_` (e.g. `OFFLOAD_PORT`)
/// 2. `offload.toml` in the working directory
/// 3. Built-in defaults
///
/// # Example
///
/// ```no_run
/// use offload_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Server
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    // Storage
    /// SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    // Work
    /// Iterations used when a request omits them.
    #[serde(default = "default_iterations")]
    pub default_iterations: u32,
    /// Largest accepted iteration count.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Largest accepted input, in characters.
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,

    // Pipeline
    /// Number of workers.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Retry hint sent with backpressure responses, in seconds.
    #[serde(default = "default_backpressure_retry_after")]
    pub backpressure_retry_after_seconds: u64,
    /// Upper bound on graceful shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    // Callbacks
    /// Largest accepted callback URL, in characters.
    #[serde(default = "default_max_callback_url_length")]
    pub max_callback_url_length: usize,
    /// Per-attempt callback timeout in seconds.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_seconds: u64,
    /// Total delivery attempts per task.
    #[serde(default = "default_callback_max_retries")]
    pub callback_max_retries: u32,
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Cap on any single retry delay, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Retry jitter fraction (0.0 to 1.0).
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,
    /// Allow callbacks to private and loopback addresses. Local testing only.
    #[serde(default)]
    pub allow_private_callbacks: bool,

    // Rate limiting
    /// Requests admitted per client within one window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    /// Window length in seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,

    // Logging
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `offload.toml`, and `OFFLOAD_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or a value is out of
    /// range.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Pipeline settings.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            default_iterations: self.default_iterations,
            max_iterations: self.max_iterations,
            max_input_length: self.max_input_length,
            worker_count: self.worker_pool_size,
            queue_capacity: self.queue_capacity,
            backpressure_retry_after: Duration::from_secs(self.backpressure_retry_after_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            guard: self.to_guard_config(),
            client: self.to_client_config(),
            retry: self.to_retry_policy(),
        }
    }

    /// Callback URL validation settings.
    pub fn to_guard_config(&self) -> GuardConfig {
        GuardConfig {
            max_url_length: self.max_callback_url_length,
            allow_private: self.allow_private_callbacks,
        }
    }

    /// Callback client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.callback_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Callback retry schedule.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.callback_max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Rate limiter settings.
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_requests,
            window: Duration::from_secs(self.rate_limit_window_seconds),
        }
    }

    /// Request timeout for the HTTP layer.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Parses the bind address.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be greater than 0");
        }

        if self.default_iterations == 0 || self.default_iterations > self.max_iterations {
            anyhow::bail!("default_iterations must be between 1 and max_iterations");
        }

        if self.callback_max_retries == 0 {
            anyhow::bail!("callback_max_retries must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.rate_limit_requests == 0 || self.rate_limit_window_seconds == 0 {
            anyhow::bail!("rate limit requests and window must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            default_iterations: default_iterations(),
            max_iterations: default_max_iterations(),
            max_input_length: default_max_input_length(),
            worker_pool_size: default_worker_pool_size(),
            queue_capacity: default_queue_capacity(),
            backpressure_retry_after_seconds: default_backpressure_retry_after(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            max_callback_url_length: default_max_callback_url_length(),
            callback_timeout_seconds: default_callback_timeout(),
            callback_max_retries: default_callback_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_factor: default_retry_jitter_factor(),
            allow_private_callbacks: false,
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_seconds: default_rate_limit_window(),
            rust_log: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_database_url() -> String {
    "sqlite://offload.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_iterations() -> u32 {
    50_000
}

fn default_max_iterations() -> u32 {
    1_000_000
}

fn default_max_input_length() -> usize {
    10_000
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_backpressure_retry_after() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_callback_url_length() -> usize {
    2048
}

fn default_callback_timeout() -> u64 {
    offload_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_callback_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_retry_jitter_factor() -> f64 {
    0.25
}

fn default_rate_limit_requests() -> u32 {
    500
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 8000);
        assert_eq!(config.queue_capacity, 1000);
        assert!(!config.allow_private_callbacks);
    }

    #[test]
    fn conversions_carry_values() {
        let config = Config {
            callback_max_retries: 3,
            retry_base_delay_ms: 500,
            allow_private_callbacks: true,
            rate_limit_requests: 10,
            ..Config::default()
        };

        let pipeline = config.to_pipeline_config();
        assert_eq!(pipeline.retry.max_attempts, 3);
        assert_eq!(pipeline.retry.base_delay, Duration::from_millis(500));
        assert!(pipeline.guard.allow_private);
        assert_eq!(pipeline.client.timeout, Duration::from_secs(10));
        assert_eq!(pipeline.backpressure_retry_after, Duration::from_secs(5));

        let limits = config.to_rate_limit_config();
        assert_eq!(limits.max_requests, 10);
        assert_eq!(limits.window, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_file_and_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, "port = 9000\nworker_pool_size = 8\n")?;
            jail.set_env("OFFLOAD_PORT", "9100");
            jail.set_env("OFFLOAD_ALLOW_PRIVATE_CALLBACKS", "true");
            jail.set_env("OFFLOAD_QUEUE_CAPACITY", "64");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.port, 9100);
            assert_eq!(config.worker_pool_size, 8);
            assert_eq!(config.queue_capacity, 64);
            assert!(config.allow_private_callbacks);
            assert_eq!(config.callback_max_retries, 5);
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("OFFLOAD_WORKER_POOL_SIZE", "0");
            let err = Config::load().unwrap_err();
            assert!(err.to_string().contains("worker_pool_size"));
            Ok(())
        });

        let config = Config { retry_jitter_factor: 1.5, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { default_iterations: 2_000_000, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_addr_parses() {
        let config = Config { host: "0.0.0.0".into(), port: 8123, ..Config::default() };
        assert_eq!(config.parse_server_addr().unwrap().to_string(), "0.0.0.0:8123");
    }
}
