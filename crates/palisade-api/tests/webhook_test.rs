//! Webhook intake tests.
//!
//! Drives `/webhooks/ingest` through the full router: signature
//! verification, replay suppression, body limits, store failures and the
//! audit trail left behind.

use std::time::Duration;

use axum::{body::Body, http::StatusCode, response::Response};
use palisade_core::{verify_chain, AuditResult};
use palisade_guard::AuditMode;
use palisade_testing::{random_payload, TestEnv, WebhookBuilder};
use serde_json::Value;
use tower::ServiceExt;

async fn send(env: &TestEnv, request: axum::http::Request<Body>) -> Response {
    env.router().oneshot(request).await.expect("failed to make request")
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response should be valid JSON")
}

/// A correctly signed delivery is accepted once.
#[tokio::test]
async fn valid_webhook_is_accepted() {
    let env = TestEnv::new();

    let response = send(&env, WebhookBuilder::new().tenant("acme").build()).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["duplicate"], false);
    assert_eq!(env.guards.record_count().await, 1);
}

/// Re-sending the identical delivery is acknowledged but flagged.
#[tokio::test]
async fn replayed_webhook_is_flagged_duplicate() {
    let env = TestEnv::new();

    let first = send(&env, WebhookBuilder::new().build()).await;
    assert_eq!(json_body(first).await["duplicate"], false);

    let replay = send(&env, WebhookBuilder::new().build()).await;
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(json_body(replay).await["duplicate"], true);
    assert_eq!(env.guards.record_count().await, 1);
}

/// Replays are recognised regardless of the hex case of the signature.
#[tokio::test]
async fn replay_detection_ignores_signature_case() {
    let env = TestEnv::new();
    let builder = WebhookBuilder::new();
    let signature = builder.signature_header().unwrap();
    let upper = format!("sha256={}", signature.trim_start_matches("sha256=").to_uppercase());

    send(&env, builder.build()).await;
    let replay = send(&env, WebhookBuilder::new().signature(upper).build()).await;

    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(json_body(replay).await["duplicate"], true);
}

/// A wrong signature is rejected without revealing anything about the body.
#[tokio::test]
async fn bad_signature_is_rejected() {
    let env = TestEnv::new();
    let request = WebhookBuilder::new().secret(b"some-other-secret").build();

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "E1001");
    assert!(!body.to_string().contains("invoice.paid"));
    assert_eq!(env.guards.record_count().await, 0);
}

/// A body altered after signing fails verification.
#[tokio::test]
async fn modified_body_is_rejected() {
    let env = TestEnv::new();
    let signature = WebhookBuilder::new().signature_header().unwrap();
    let request = WebhookBuilder::new()
        .body(br#"{"event":"invoice.paid","amount":1}"#.to_vec())
        .signature(signature)
        .build();

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Missing headers are treated as a failed verification.
#[tokio::test]
async fn missing_headers_are_rejected() {
    let env = TestEnv::new();

    let response = send(&env, WebhookBuilder::new().timestamp(None).build()).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"]["code"], "E1001");
}

/// Signatures older than the allowed skew are stale.
#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let env = TestEnv::new();
    let request = WebhookBuilder::new().build();
    env.advance_time(Duration::from_secs(301));

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Timestamps within the skew are accepted in either direction.
#[tokio::test]
async fn timestamp_within_skew_is_accepted() {
    let env = TestEnv::new();
    let request = WebhookBuilder::new().build();
    env.advance_time(Duration::from_secs(299));

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::OK);
}

/// A non-numeric timestamp never verifies.
#[tokio::test]
async fn garbage_timestamp_is_rejected() {
    let env = TestEnv::new();

    let response = send(&env, WebhookBuilder::new().timestamp(Some("yesterday")).build()).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Bodies over the configured limit are refused before verification.
#[tokio::test]
async fn oversized_body_is_rejected() {
    let env = TestEnv::builder().max_body_bytes(64).build();
    let request = WebhookBuilder::new().body(random_payload(256)).build();

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error"]["code"], "E1002");
    assert_eq!(env.guards.record_count().await, 0);
}

/// A body that fails mid-stream is a bad request, not an oversized one.
#[tokio::test]
async fn unreadable_body_is_a_bad_request() {
    let env = TestEnv::new();
    let (parts, _) = WebhookBuilder::new().build().into_parts();
    let chunks = futures::stream::iter([
        Ok(b"{\"event\":".to_vec()),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
    ]);
    let request = axum::http::Request::from_parts(parts, Body::from_stream(chunks));

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "E1004");
    assert_eq!(env.guards.record_count().await, 0);
}

/// A streamed body crossing the limit is still refused as too large.
#[tokio::test]
async fn streamed_oversized_body_is_rejected() {
    let env = TestEnv::builder().max_body_bytes(64).build();
    let (parts, _) = WebhookBuilder::new().build().into_parts();
    let chunks = futures::stream::iter(
        (0..4).map(|_| Ok::<_, std::io::Error>(random_payload(32))).collect::<Vec<_>>(),
    );
    let request = axum::http::Request::from_parts(parts, Body::from_stream(chunks));

    let response = send(&env, request).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error"]["code"], "E1002");
}

/// An unreachable replay store yields a retryable 503, never a duplicate
/// or an acceptance.
#[tokio::test]
async fn unavailable_store_returns_service_unavailable() {
    let env = TestEnv::new();
    env.guards.set_unavailable(Some("connection refused")).await;

    let response = send(&env, WebhookBuilder::new().build()).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"]["code"], "E4001");
}

/// A store slower than the deadline is reported as a timeout.
#[tokio::test]
async fn slow_store_times_out() {
    let env = TestEnv::builder().store_timeout(Duration::from_millis(50)).build();
    env.guards.set_latency(Some(Duration::from_millis(500))).await;

    let response = send(&env, WebhookBuilder::new().build()).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"]["code"], "E4002");
}

/// Receipts and replays land in the tenant's hash chain.
#[tokio::test]
async fn deliveries_are_audited_in_a_valid_chain() {
    let env = TestEnv::new();

    send(&env, WebhookBuilder::new().tenant("acme").build()).await;
    send(&env, WebhookBuilder::new().tenant("acme").build()).await;
    send(&env, WebhookBuilder::new().tenant("globex").body(random_payload(8)).build()).await;

    let trail = env.audit_trail("acme").await;
    let actions: Vec<_> = trail.iter().map(|entry| entry.action.as_str()).collect();
    assert_eq!(actions, ["webhook.received", "webhook.replayed"]);
    assert!(trail.iter().all(|entry| entry.result == AuditResult::Success));
    assert_eq!(trail[0].user_agent.as_deref(), Some("palisade-test/1.0"));
    assert_eq!(trail[0].new_value.as_ref().unwrap()["duplicate"], false);
    assert_eq!(verify_chain(&trail), Ok(()));

    assert_eq!(env.audit_trail("globex").await.len(), 1);
}

/// Rejected deliveries leave no audit entries behind.
#[tokio::test]
async fn rejections_are_not_audited() {
    let env = TestEnv::new();

    send(&env, WebhookBuilder::new().signature("00".repeat(32)).build()).await;

    assert!(env.guards.audit_entries().await.is_empty());
}

/// In best-effort mode an audit outage does not block intake.
#[tokio::test]
async fn best_effort_audit_failure_still_accepts() {
    let env = TestEnv::builder().audit_mode(AuditMode::BestEffort).build();
    env.guards.set_audit_unavailable(Some("disk full")).await;

    let response = send(&env, WebhookBuilder::new().build()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(env.guards.audit_entries().await.is_empty());
}

/// In synchronous mode an audit outage fails the request; the delivery is
/// already admitted, so a retry is acknowledged as a duplicate.
#[tokio::test]
async fn synchronous_audit_failure_fails_request() {
    let env = TestEnv::builder().audit_mode(AuditMode::Synchronous).build();
    env.guards.set_audit_unavailable(Some("disk full")).await;

    let response = send(&env, WebhookBuilder::new().build()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"]["code"], "E4003");

    env.guards.set_audit_unavailable(None).await;
    let retry = send(&env, WebhookBuilder::new().build()).await;
    assert_eq!(retry.status(), StatusCode::OK);
    assert_eq!(json_body(retry).await["duplicate"], true);
}
