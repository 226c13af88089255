//! HTTP server setup and routing.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use offload_pipeline::{Pipeline, SlidingWindowLimiter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    handlers::{health, requests, submit},
    middleware::rate_limit,
};

/// Header carrying the per-request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Request-processing pipeline
    pub pipeline: Arc<Pipeline>,
    /// Per-client admission control
    pub limiter: Arc<SlidingWindowLimiter>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Creates state with the uptime clock starting now.
    pub fn new(pipeline: Arc<Pipeline>, limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { pipeline, limiter, started_at: Instant::now() }
    }
}

/// Creates the router with all routes and middleware configured.
///
/// `/healthz` is exempt from rate limiting so probes keep working while a
/// client is throttled.
pub fn create_router(state: AppState, config: &Config) -> Router {
    let limited = Router::new()
        .route("/sync", post(submit::submit_sync))
        .route("/async", post(submit::submit_async))
        .route("/requests", get(requests::list_requests))
        .route("/requests/{id}", get(requests::get_request))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit::enforce_rate_limit));

    Router::new()
        .route("/healthz", get(health::health_check))
        .merge(limited)
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Binds the listener and serves until `shutdown` is cancelled.
///
/// The peer address of each connection is exposed to handlers as
/// `ConnectInfo<SocketAddr>`; the rate limiter keys on it.
///
/// # Errors
///
/// Returns error if the address cannot be bound or the server fails.
pub async fn start_server(
    state: AppState,
    config: &Config,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = config.parse_server_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr().context("failed to read bound address")?;

    info!(address = %local_addr, "HTTP server listening");

    let app = create_router(state, config);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

/// Completes when the process receives Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}

/// Assigns each request an id, echoing one supplied by the caller.
async fn inject_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    if let Some(id) = &request_id {
        request.headers_mut().insert(REQUEST_ID_HEADER, id.clone());
    }

    let mut response = next.run(request).await;
    if let Some(id) = request_id {
        response.headers_mut().insert(REQUEST_ID_HEADER, id);
    }
    response
}
