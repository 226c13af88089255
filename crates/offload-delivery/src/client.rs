//! HTTP client for callback delivery.
//!
//! Redirects are never followed and proxies are ignored. When the callback
//! URL names a domain, each attempt connects only to the addresses the
//! guard just validated, so the HTTP stack never performs its own lookup.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use offload_core::{TaskId, TaskStatus};
use reqwest::{header::LOCATION, redirect::Policy, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    url_guard::VettedUrl,
};

/// Header carrying the task identifier.
pub const TASK_ID_HEADER: &str = "X-Task-Id";

/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Attempt-Number";

const MAX_RESPONSE_BODY: usize = 1024;

/// Configuration for the callback client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("offload-callback/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// JSON body posted to the callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// Task the result belongs to.
    pub task_id: TaskId,
    /// Final task status.
    pub status: TaskStatus,
    /// Work result when succeeded.
    pub result: Option<String>,
    /// Error classification when failed.
    pub error: Option<String>,
    /// Iterations requested.
    pub iterations: u32,
    /// Work duration.
    pub duration_ms: Option<u64>,
    /// When the task completed; lets receivers order out-of-order callbacks.
    pub timestamp: DateTime<Utc>,
}

/// Response to a successful attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code (2xx).
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// HTTP client for callback delivery.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = builder(&config).build().map_err(|e| {
            DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Posts `payload` to a vetted URL.
    ///
    /// # Errors
    ///
    /// - `Network` for connection failures
    /// - `Timeout` when the attempt exceeds the configured timeout
    /// - `Redirected` for 3xx responses
    /// - `HttpStatus` for any other non-2xx response
    pub async fn send(
        &self,
        target: &VettedUrl,
        payload: &CallbackPayload,
        attempt_number: u32,
    ) -> Result<DeliveryResponse> {
        let span = info_span!(
            "callback_delivery",
            task_id = %payload.task_id,
            url = %target.url,
            attempt = attempt_number
        );

        async move {
            let start = Instant::now();
            let client = self.client_for(target)?;

            let response = client
                .post(target.url.clone())
                .header(TASK_ID_HEADER, payload.task_id.to_string())
                .header(ATTEMPT_HEADER, attempt_number.to_string())
                .json(payload)
                .send()
                .await
                .map_err(|e| self.classify(&e))?;

            let duration = start.elapsed();
            debug!(
                status = response.status().as_u16(),
                duration_ms = duration.as_millis(),
                "received callback response"
            );

            parse_response(response, duration).await
        }
        .instrument(span)
        .await
    }

    /// Client that connects only to the vetted addresses.
    ///
    /// Resolve overrides are fixed when a reqwest client is built, and every
    /// attempt re-resolves the host, so a pinned client is built per attempt
    /// to a domain. IP-literal URLs reuse the shared client.
    fn client_for(&self, target: &VettedUrl) -> Result<reqwest::Client> {
        let Some(domain) = target.domain.as_deref() else {
            return Ok(self.client.clone());
        };
        builder(&self.config).resolve_to_addrs(domain, &target.addrs).build().map_err(|e| {
            DeliveryError::configuration(format!("failed to build pinned HTTP client: {e}"))
        })
    }

    fn classify(&self, err: &reqwest::Error) -> DeliveryError {
        warn!(error = %err, "callback request failed");
        if err.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else if err.is_connect() {
            DeliveryError::network(format!("connection failed: {err}"))
        } else {
            DeliveryError::network(err.to_string())
        }
    }
}

fn builder(config: &ClientConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(&config.user_agent)
        .redirect(Policy::none())
        .no_proxy()
}

async fn parse_response(response: Response, duration: Duration) -> Result<DeliveryResponse> {
    let status = response.status();
    let status_code = status.as_u16();

    if status.is_redirection() {
        let location =
            response.headers().get(LOCATION).and_then(|v| v.to_str().ok()).map(str::to_owned);
        return Err(DeliveryError::redirected(status_code, location));
    }

    let body = match response.bytes().await {
        Ok(bytes) => truncate(&String::from_utf8_lossy(&bytes)),
        Err(e) => format!("[failed to read response body: {e}]"),
    };

    if status.is_success() {
        Ok(DeliveryResponse { status_code, body, duration })
    } else {
        Err(DeliveryError::http_status(status_code, body))
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BODY {
        return body.to_string();
    }
    let mut end = MAX_RESPONSE_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::url_guard::{GuardConfig, StaticResolver, UrlGuard};

    fn payload() -> CallbackPayload {
        CallbackPayload {
            task_id: TaskId::new(),
            status: TaskStatus::Succeeded,
            result: Some("abc123".into()),
            error: None,
            iterations: 1000,
            duration_ms: Some(3),
            timestamp: Utc::now(),
        }
    }

    async fn vet(url: &str) -> VettedUrl {
        UrlGuard::new(GuardConfig { max_url_length: 2048, allow_private: true })
            .check(url)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn posts_json_with_tracking_headers() {
        let server = MockServer::start().await;
        let payload = payload();
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/cb"))
            .and(matchers::header(TASK_ID_HEADER, payload.task_id.to_string().as_str()))
            .and(matchers::header(ATTEMPT_HEADER, "2"))
            .and(matchers::body_partial_json(serde_json::json!({
                "status": "succeeded",
                "result": "abc123",
                "iterations": 1000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = vet(&format!("{}/cb", server.uri())).await;
        let response = client.send(&target, &payload, 2).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn server_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let err = client.send(&vet(&server.uri()).await, &payload(), 1).await.unwrap_err();
        assert!(matches!(err, DeliveryError::HttpStatus { status_code: 503, .. }));
    }

    #[tokio::test]
    async fn redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/start"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = vet(&format!("{}/start", server.uri())).await;
        let err = client.send(&target, &payload(), 1).await.unwrap_err();

        match err {
            DeliveryError::Redirected { status_code, location } => {
                assert_eq!(status_code, 302);
                assert_eq!(location.as_deref(), Some("http://169.254.169.254/"));
            },
            other => panic!("expected redirect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        })
        .unwrap();
        let err = client.send(&vet(&server.uri()).await, &payload(), 1).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { .. }));
    }

    #[tokio::test]
    async fn domain_connects_to_vetted_address() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let addr: SocketAddr = *server.address();
        let resolver = StaticResolver::new().answer("callback.test", [addr.ip()]);
        let guard = UrlGuard::with_resolver(
            GuardConfig { max_url_length: 2048, allow_private: true },
            Arc::new(resolver),
        );
        let target = guard.check(&format!("http://callback.test:{}/hook", addr.port())).await.unwrap();

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.send(&target, &payload(), 1).await.unwrap();
        assert_eq!(response.status_code, 204);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(5000);
        let truncated = truncate(&body);
        assert!(truncated.ends_with("... (truncated)"));
        assert!(truncated.len() < 1100);
    }
}
