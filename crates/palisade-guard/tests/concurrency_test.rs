//! Concurrent behaviour of the guards against the in-memory store.
//!
//! The mock store performs each operation atomically under one lock, like
//! the single SQL statements it stands in for, so these tests exercise the
//! guards' reliance on atomic primitives rather than on read-then-write.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use palisade_core::{RateLimitKey, TestClock};
use palisade_crypto::{sign, verify_webhook};
use palisade_guard::{
    storage::mock::MockGuardStorage, Admission, FailureMode, IdempotencyGuard, RateLimiter,
};

const SECRET: &[u8] = b"concurrency-secret";
const TS: &str = "1700000000";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_signature_admitted_exactly_once_under_contention() {
    let storage = MockGuardStorage::new();
    let guard = IdempotencyGuard::new(Arc::new(storage.clone()), Arc::new(TestClock::new()));

    let body = Bytes::from_static(b"{\"event\":\"invoice.paid\"}");
    let signature = sign(&body, TS, SECRET).unwrap();
    let webhook =
        verify_webhook(body, Some(TS), Some(&signature), SECRET, 300, 1_700_000_000).unwrap();

    let tasks = (0..64).map(|_| {
        let guard = guard.clone();
        let webhook = webhook.clone();
        tokio::spawn(async move { guard.admit_once(&webhook).await.unwrap() })
    });
    let outcomes: Vec<Admission> =
        join_all(tasks).await.into_iter().map(|joined| joined.unwrap()).collect();

    let first = outcomes.iter().filter(|a| **a == Admission::First).count();
    let duplicates = outcomes.iter().filter(|a| a.is_duplicate()).count();

    assert_eq!(first, 1);
    assert_eq!(duplicates, 63);
    assert_eq!(storage.record_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_exceed_ceiling() {
    let storage = MockGuardStorage::new();
    let limiter = RateLimiter::new(
        Arc::new(storage.clone()),
        Arc::new(TestClock::at_unix(1_700_000_000)),
        FailureMode::Closed,
    );
    let key = RateLimitKey::from_parts(Some("acme"), Some("sk_live_concurrency_key"));
    let ceiling = 25;

    let tasks = (0..100).map(|_| {
        let limiter = limiter.clone();
        let key = key.clone();
        tokio::spawn(async move { limiter.allow(&key, ceiling).await })
    });
    let allowed =
        join_all(tasks).await.into_iter().filter(|joined| *joined.as_ref().unwrap()).count();

    assert_eq!(allowed, 25);
}
