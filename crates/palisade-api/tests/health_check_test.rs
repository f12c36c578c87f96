//! Health probe endpoint tests.
//!
//! Covers `/health`, `/ready` and `/live` against a controllable readiness
//! probe.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use palisade_testing::TestEnv;
use serde_json::Value;
use tower::ServiceExt;

async fn get(env: &TestEnv, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = env.router().oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    (status, serde_json::from_slice(&body).expect("response should be valid JSON"))
}

/// A reachable store reports healthy with component details.
#[tokio::test]
async fn health_check_returns_success_when_healthy() {
    let env = TestEnv::new();

    let (status, body) = get(&env, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "up");
    assert!(body["version"].is_string());
    assert!(body["timestamp"].is_string());
}

/// An unreachable store turns both health and readiness into 503.
#[tokio::test]
async fn health_and_readiness_fail_when_store_is_down() {
    let env = TestEnv::new();
    env.probe.set_healthy(false);

    let (status, body) = get(&env, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "down");

    let (status, _) = get(&env, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

/// Recovery is picked up on the next probe.
#[tokio::test]
async fn readiness_recovers_with_the_store() {
    let env = TestEnv::new();
    env.probe.set_healthy(false);
    let (status, _) = get(&env, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    env.probe.set_healthy(true);
    let (status, body) = get(&env, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

/// Liveness never consults the store.
#[tokio::test]
async fn liveness_ignores_store_state() {
    let env = TestEnv::new();
    env.probe.set_healthy(false);

    let (status, body) = get(&env, "/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "palisade");
}

/// Every response carries a request id.
#[tokio::test]
async fn responses_carry_request_id() {
    let env = TestEnv::new();
    let request = Request::builder().uri("/live").body(Body::empty()).unwrap();

    let response = env.router().oneshot(request).await.unwrap();

    let request_id = response.headers().get("x-request-id").expect("request id header");
    assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
}
