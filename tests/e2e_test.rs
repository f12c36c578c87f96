//! End-to-end tests across the palisade components.
//!
//! Drives complete tenant flows through the router and the full key
//! rotation lifecycle against in-memory stores: encrypt under one version,
//! promote a new one, sweep, wait out the grace window and retire.

use std::{sync::Arc, time::Duration};

use axum::{body::Body, http::StatusCode, response::Response};
use palisade_core::{masking::mask_email, verify_chain, AuditResult, Clock, PalisadeError};
use palisade_crypto::{
    rotation::mock::MemoryColumnStore, ColumnTarget, CryptoError, DataKey, EncryptedColumnStore,
    EncryptedValue, KeyRegistry, KeyRetirement, KeyVersion, RotationSweep,
};
use palisade_testing::{grant_request, TestEnv, WebhookBuilder, INITIAL_KEY_VERSION};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const GRACE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

async fn send(env: &TestEnv, request: axum::http::Request<Body>) -> Response {
    env.router().oneshot(request).await.expect("failed to make request")
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn version(name: &str) -> KeyVersion {
    KeyVersion::new(name).unwrap()
}

fn customer_emails() -> Arc<MemoryColumnStore> {
    Arc::new(MemoryColumnStore::new(ColumnTarget::parse("customers.id.email").unwrap()))
}

async fn seed_customers(env: &TestEnv, store: &MemoryColumnStore, count: usize) {
    for i in 0..count {
        let ciphertext = env.engine.encrypt(&format!("user{i}@acme.test"), None).await.unwrap();
        store.insert(format!("{i:04}"), ciphertext).await;
    }
}

fn retirement(env: &TestEnv, stores: Vec<Arc<dyn EncryptedColumnStore>>) -> KeyRetirement {
    let clock: Arc<dyn Clock> = Arc::new(env.clock.clone());
    KeyRetirement::new(env.keys.clone(), stores, GRACE, clock)
}

/// A tenant's webhook intake and evidence download share one intact audit
/// chain, separate from other tenants.
#[tokio::test]
async fn tenant_activity_forms_one_audit_chain() {
    let env = TestEnv::new();
    let artifact = env.store_artifact("acme", "acme/soc2.pdf", b"%PDF soc2 report").await;

    let delivery = send(&env, WebhookBuilder::new().tenant("acme").build()).await;
    assert_eq!(delivery.status(), StatusCode::OK);

    let replay = send(&env, WebhookBuilder::new().tenant("acme").build()).await;
    assert_eq!(json_body(replay).await["duplicate"], true);

    let grant = send(&env, grant_request(artifact.id, Some("acme"))).await;
    assert_eq!(grant.status(), StatusCode::OK);

    let denied = send(&env, grant_request(artifact.id, Some("globex"))).await;
    assert_eq!(denied.status(), StatusCode::NOT_FOUND);

    let trail = env.audit_trail("acme").await;
    let actions: Vec<_> = trail.iter().map(|entry| entry.action.as_str()).collect();
    assert_eq!(actions, ["webhook.received", "webhook.replayed", "evidence.grant_issued"]);
    assert_eq!(verify_chain(&trail), Ok(()));
    assert!(env.audit_trail("globex").await.is_empty());
}

/// Editing a stored audit entry is detected by chain verification.
#[tokio::test]
async fn tampering_with_the_audit_trail_is_detected() {
    let env = TestEnv::new();
    for _ in 0..3 {
        send(&env, WebhookBuilder::new().tenant("acme").body(b"{}".to_vec()).build()).await;
        env.advance_time(Duration::from_secs(1));
    }

    let mut entries = env.guards.audit_entries().await;
    let mut forged = entries[1].clone();
    forged.result = AuditResult::Denied;
    env.guards.tamper_audit_entry(1, forged.clone()).await;
    entries[1] = forged;

    assert!(verify_chain(&entries).is_err());
}

/// Evidence altered after registration is never granted, for any caller.
#[tokio::test]
async fn tampered_evidence_stays_locked() {
    let env = TestEnv::new();
    let artifact = env.store_artifact("acme", "acme/pentest.pdf", b"findings: none").await;
    env.tamper_object("acme/pentest.pdf", b"findings: none (edited)").await;

    for _ in 0..2 {
        let response = send(&env, grant_request(artifact.id, Some("acme"))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    let trail = env.audit_trail("acme").await;
    assert_eq!(trail.len(), 2);
    assert!(trail.iter().all(|entry| entry.result == AuditResult::Denied));
}

/// Values written under the old key stay readable while a new key is
/// current, before any sweep has run.
#[tokio::test]
async fn promotion_keeps_old_values_readable() {
    let env = TestEnv::new();
    let old = env.engine.encrypt("alice@acme.test", None).await.unwrap();

    env.keys.install(version("v2"), DataKey::generate()).await.unwrap();
    env.keys.promote(&version("v2")).await.unwrap();
    let new = env.engine.encrypt("bob@acme.test", None).await.unwrap();

    assert_eq!(EncryptedValue::peek_version(&old).unwrap(), version(INITIAL_KEY_VERSION));
    assert_eq!(EncryptedValue::peek_version(&new).unwrap(), version("v2"));
    assert_eq!(env.engine.decrypt(&old).await.unwrap(), "alice@acme.test");
    assert_eq!(env.engine.decrypt(&new).await.unwrap(), "bob@acme.test");
}

/// The complete lifecycle: promote, sweep, grace window, retire.
#[tokio::test]
async fn key_rotation_lifecycle() {
    let env = TestEnv::new();
    let emails = customer_emails();
    seed_customers(&env, &emails, 25).await;
    let stale = emails.get("0000").await.unwrap();

    env.keys.install(version("v2"), DataKey::generate()).await.unwrap();
    env.keys.promote(&version("v2")).await.unwrap();

    let stores: Vec<Arc<dyn EncryptedColumnStore>> = vec![emails.clone()];
    let retire = retirement(&env, stores);
    let v1 = version(INITIAL_KEY_VERSION);

    let blocked = retire.retire(&v1).await.unwrap_err();
    assert!(matches!(blocked, CryptoError::RetirementBlocked { .. }));

    let sweep = RotationSweep::new(env.engine.clone(), emails.clone())
        .with_batch_size(10)
        .with_concurrency(4);
    let report = sweep.run(&v1, CancellationToken::new()).await.unwrap();
    assert_eq!(report.scanned, 25);
    assert_eq!(report.rotated, 25);
    assert!(report.is_complete());

    for (row_id, value) in emails.snapshot().await {
        assert_eq!(EncryptedValue::peek_version(&value).unwrap(), version("v2"));
        let index: usize = row_id.parse().unwrap();
        assert_eq!(env.engine.decrypt(&value).await.unwrap(), format!("user{index}@acme.test"));
    }

    // Sweep is done but the grace window is still open
    let blocked = retire.retire(&v1).await.unwrap_err();
    assert!(matches!(blocked, CryptoError::RetirementBlocked { .. }));

    env.advance_time(GRACE + Duration::from_secs(1));
    retire.retire(&v1).await.unwrap();

    assert_eq!(env.keys.resolvable_versions().await.unwrap(), vec![version("v2")]);

    let err = env.engine.decrypt(&stale).await.unwrap_err();
    assert!(matches!(err, CryptoError::KeyRetired { .. }));
    let err = PalisadeError::from(err);
    assert_eq!(err.code(), "E2002");
    assert!(!err.is_retryable());
}

/// Rows left on the old version block retirement even after the grace
/// window.
#[tokio::test]
async fn unswept_rows_block_retirement() {
    let env = TestEnv::new();
    let emails = customer_emails();
    seed_customers(&env, &emails, 3).await;

    env.keys.install(version("v2"), DataKey::generate()).await.unwrap();
    env.keys.promote(&version("v2")).await.unwrap();
    env.advance_time(GRACE + Duration::from_secs(1));

    let stores: Vec<Arc<dyn EncryptedColumnStore>> = vec![emails.clone()];
    let retire = retirement(&env, stores);
    let err = retire.retire(&version(INITIAL_KEY_VERSION)).await.unwrap_err();

    assert!(matches!(err, CryptoError::RetirementBlocked { .. }));
    let unswept = emails.get("0001").await.unwrap();
    assert_eq!(env.engine.decrypt(&unswept).await.unwrap(), "user1@acme.test");
}

/// A second sweep over an already rotated column changes nothing.
#[tokio::test]
async fn sweep_is_idempotent() {
    let env = TestEnv::new();
    let emails = customer_emails();
    seed_customers(&env, &emails, 5).await;
    env.keys.install(version("v2"), DataKey::generate()).await.unwrap();
    env.keys.promote(&version("v2")).await.unwrap();

    let sweep = RotationSweep::new(env.engine.clone(), emails.clone());
    let v1 = version(INITIAL_KEY_VERSION);
    sweep.run(&v1, CancellationToken::new()).await.unwrap();
    let after_first = emails.snapshot().await;

    let report = sweep.run(&v1, CancellationToken::new()).await.unwrap();

    assert_eq!(report.rotated, 0);
    assert_eq!(emails.snapshot().await, after_first);
}

/// A write racing the sweep wins; the row is left for the next pass.
#[tokio::test]
async fn concurrent_write_during_sweep_is_preserved() {
    let env = TestEnv::new();
    let emails = customer_emails();
    seed_customers(&env, &emails, 4).await;
    env.keys.install(version("v2"), DataKey::generate()).await.unwrap();
    env.keys.promote(&version("v2")).await.unwrap();

    let fresh = env.engine.encrypt("changed@acme.test", None).await.unwrap();
    emails.inject_concurrent_write("0002", fresh.clone()).await;

    let sweep = RotationSweep::new(env.engine.clone(), emails.clone());
    let report = sweep.run(&version(INITIAL_KEY_VERSION), CancellationToken::new()).await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.rotated, 3);
    assert_eq!(emails.get("0002").await.unwrap(), fresh);
    assert_eq!(env.engine.decrypt(&fresh).await.unwrap(), "changed@acme.test");
}

/// A cancelled sweep stops and reports itself incomplete.
#[tokio::test]
async fn cancelled_sweep_reports_incomplete() {
    let env = TestEnv::new();
    let emails = customer_emails();
    seed_customers(&env, &emails, 5).await;
    env.keys.install(version("v2"), DataKey::generate()).await.unwrap();
    env.keys.promote(&version("v2")).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let sweep = RotationSweep::new(env.engine.clone(), emails.clone());
    let report = sweep.run(&version(INITIAL_KEY_VERSION), cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(!report.is_complete());
    assert_eq!(report.rotated, 0);
}

/// Personal data is masked before it is written into audit snapshots.
#[tokio::test]
async fn masked_email_is_safe_for_audit_snapshots() {
    let env = TestEnv::new();
    let masked = mask_email("alice.smith@acme.test");

    let event = palisade_core::AuditEvent::new(
        palisade_core::TenantId::new("acme").unwrap(),
        "customer.updated",
        "customer",
        env.clock.now_utc(),
    )
    .with_change(None, Some(serde_json::json!({ "email": masked })));
    env.state.audit.record(event).await.unwrap();

    let trail = env.audit_trail("acme").await;
    let snapshot = trail[0].new_value.as_ref().unwrap().to_string();
    assert!(!snapshot.contains("alice.smith"));
    assert!(snapshot.contains("@acme.test"));
}
