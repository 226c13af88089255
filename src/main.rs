//! Offload request-offloading service.
//!
//! Main entry point. Loads configuration, opens the task store, starts the
//! worker pool and the HTTP server, and coordinates graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use offload_api::{shutdown_signal, start_server, AppState, Config};
use offload_core::{RealClock, SqliteTaskStore};
use offload_pipeline::{Pipeline, SlidingWindowLimiter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_pool_size,
        queue_capacity = config.queue_capacity,
        "Starting offload service"
    );
    if config.allow_private_callbacks {
        warn!("private callback addresses are allowed; do not use this setting in production");
    }

    let store = Arc::new(
        SqliteTaskStore::connect(&config.database_url, config.database_max_connections)
            .await
            .context("Failed to open task store")?,
    );

    let clock = Arc::new(RealClock::new());
    let pipeline = Arc::new(
        Pipeline::builder(store.clone(), config.to_pipeline_config())
            .clock(clock.clone())
            .build()
            .context("Failed to build pipeline")?,
    );
    let recovered = pipeline
        .reconcile_unfinished()
        .await
        .context("Failed to reconcile tasks left unfinished by a previous run")?;
    if recovered > 0 {
        warn!(recovered, "marked tasks from a previous run as failed");
    }
    pipeline.start().await;

    let shutdown = CancellationToken::new();
    let limiter = Arc::new(SlidingWindowLimiter::new(config.to_rate_limit_config(), clock));
    let sweeper = limiter.clone().spawn_sweeper(shutdown.clone());

    let signal = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let served = start_server(AppState::new(pipeline.clone(), limiter), &config, shutdown.clone()).await;
    if let Err(e) = &served {
        error!(error = %e, "Server failed");
    }
    shutdown.cancel();
    signal.abort();

    let report = pipeline.shutdown().await;
    if report.workers_stopped && report.deliveries_settled {
        info!(abandoned_tasks = report.abandoned_tasks, "Pipeline stopped");
    } else {
        error!(?report, "Pipeline shutdown incomplete");
    }

    if let Err(e) = sweeper.await {
        warn!(error = %e, "Rate limiter sweeper ended abnormally");
    }

    store.close().await;
    info!("Offload shutdown complete");
    served
}

/// Initializes tracing with environment-based configuration.
///
/// `RUST_LOG` wins; otherwise the configured level applies, with debug
/// output for this service and the HTTP layer.
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{level},offload=debug,tower_http=debug")))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}
