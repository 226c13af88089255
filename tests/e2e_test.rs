//! End-to-end tests: HTTP submission through work, persistence, and
//! callback delivery.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use offload_api::{create_router, AppState, Config};
use offload_pipeline::{Pipeline, SlidingWindowLimiter};
use offload_testing::{matchers, Mock, ResponseTemplate, TestEnv};
use serde_json::{json, Value};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(10);

/// Service wired the way the binary wires it, over a test environment.
fn service(env: &TestEnv, config: &Config) -> Result<(Arc<Pipeline>, Router)> {
    let pipeline = env.pipeline(config.to_pipeline_config())?;
    let limiter = Arc::new(SlidingWindowLimiter::new(
        config.to_rate_limit_config(),
        Arc::new(env.clock.clone()),
    ));
    let app = create_router(AppState::new(pipeline.clone(), limiter), config);
    Ok((pipeline, app))
}

fn local_config() -> Config {
    Config { allow_private_callbacks: true, callback_timeout_seconds: 2, ..Config::default() }
}

async fn call(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// The golden path: accepted, computed, delivered exactly once.
#[tokio::test]
async fn async_request_is_computed_and_posted_once() -> Result<()> {
    let env = TestEnv::new().await?;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/receiver"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.callback_server)
        .await;

    let (pipeline, app) = service(&env, &local_config())?;
    pipeline.start().await;

    let (status, accepted) = call(
        &app,
        post_json(
            "/async",
            &json!({
                "input": "hello",
                "iterations": 1000,
                "callback_url": env.callback_url("/receiver"),
            }),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = accepted["request_id"].as_str().unwrap().to_string();

    env.wait_for_delivery(id.parse()?, WAIT).await?;

    let (status, detail) = call(&app, get(&format!("/requests/{id}"))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "succeeded");
    assert_eq!(detail["iterations"], 1000);
    assert_eq!(detail["delivery_trace"].as_array().unwrap().len(), 1);
    let digest = detail["result"].as_str().unwrap();
    assert_eq!(digest.len(), 64);

    let received = env.callback_server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let callback: Value = serde_json::from_slice(&received[0].body)?;
    assert_eq!(callback["task_id"], id.as_str());
    assert_eq!(callback["status"], "succeeded");
    assert_eq!(callback["result"], digest);
    assert_eq!(received[0].headers["x-task-id"], id.as_str());
    assert_eq!(received[0].headers["x-attempt-number"], "1");

    // The callback carries the same digest the inline path computes.
    let (_, inline) =
        call(&app, post_json("/sync", &json!({ "input": "hello", "iterations": 1000 }))).await?;
    assert_eq!(inline["result"], digest);

    pipeline.shutdown().await;
    Ok(())
}

/// A cloud metadata URL is refused up front and leaves no trace in storage.
#[tokio::test]
async fn metadata_callback_is_refused_before_anything_is_stored() -> Result<()> {
    let env = TestEnv::new().await?;
    let (pipeline, app) = service(&env, &Config::default())?;
    pipeline.start().await;

    let (status, body) = call(
        &app,
        post_json(
            "/async",
            &json!({ "input": "hello", "callback_url": "http://169.254.169.254/latest/meta-data/" }),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SSRF_REJECTED");

    let (_, listing) = call(&app, get("/requests")).await?;
    assert!(listing["requests"].as_array().unwrap().is_empty());

    pipeline.shutdown().await;
    Ok(())
}

/// A receiver that recovers after two failures sees three attempts, and the
/// trace records each of them in order.
#[tokio::test]
async fn flaky_receiver_is_retried_until_delivered() -> Result<()> {
    let env = TestEnv::new().await?;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&env.callback_server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.callback_server)
        .await;

    let (pipeline, app) = service(&env, &local_config())?;
    pipeline.start().await;

    let (_, accepted) = call(
        &app,
        post_json("/async", &json!({ "input": "retry me", "callback_url": env.callback_url("/cb") })),
    )
    .await?;
    let id = accepted["request_id"].as_str().unwrap().to_string();
    env.wait_for_delivery(id.parse()?, WAIT).await?;

    let (_, detail) = call(&app, get(&format!("/requests/{id}"))).await?;
    let outcomes: Vec<_> = detail["delivery_trace"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["outcome"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(outcomes, ["failed", "failed", "delivered"]);
    assert_eq!(detail["callback_status"], "delivered");
    assert_eq!(detail["callback_attempts"], 3);

    pipeline.shutdown().await;
    Ok(())
}

/// Work still queued at shutdown is failed explicitly rather than lost.
#[tokio::test]
async fn queued_work_is_failed_at_shutdown() -> Result<()> {
    let env = TestEnv::new().await?;
    let (pipeline, app) = service(&env, &local_config())?;

    let (status, accepted) = call(
        &app,
        post_json("/async", &json!({ "input": "late", "callback_url": env.callback_url("/cb") })),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = accepted["request_id"].as_str().unwrap().to_string();

    let report = pipeline.shutdown().await;
    assert_eq!(report.abandoned_tasks, 1);

    let (_, detail) = call(&app, get(&format!("/requests/{id}"))).await?;
    assert_eq!(detail["status"], "failed");
    assert_eq!(detail["error"], offload_pipeline::ABANDONED_BEFORE_EXECUTION);

    let (status, health) = call(&app, get("/healthz")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["accepting"], false);
    assert_eq!(health["status"], "degraded");
    Ok(())
}
