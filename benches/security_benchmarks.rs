//! Performance benchmarks for the request-path security checks.
//!
//! Tracks the per-request cost of:
//! - Webhook signature computation and verification by payload size
//! - Column encryption and decryption
//! - Full webhook intake through the router against in-memory stores

use std::{hint::black_box, sync::Arc, time::Duration};

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use palisade_core::{Clock, TestClock};
use palisade_crypto::{
    sign, verify_at, ColumnEncryptionEngine, DataKey, KeyVersion, StaticKeyRegistry,
};
use palisade_testing::{random_payload, TestEnv, WebhookBuilder};
use tokio::runtime::Runtime;
use tower::ServiceExt;

const SECRET: &[u8] = b"whsec_benchmark_secret";
const TIMESTAMP: &str = "1700000000";
const NOW: i64 = 1_700_000_000;

/// Benchmarks HMAC signing and verification across payload sizes.
fn bench_signatures(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");

    for size in [256, 4 * 1024, 64 * 1024, 1024 * 1024] {
        let body = random_payload(size);
        let signature = sign(&body, TIMESTAMP, SECRET).unwrap();
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("sign", size), &body, |b, body| {
            b.iter(|| sign(black_box(body), TIMESTAMP, SECRET));
        });

        group.bench_with_input(BenchmarkId::new("verify", size), &body, |b, body| {
            b.iter(|| {
                verify_at(
                    black_box(body),
                    Some(TIMESTAMP),
                    Some(&signature),
                    SECRET,
                    300,
                    NOW,
                )
            });
        });
    }

    group.finish();
}

/// Benchmarks column encryption round trips.
fn bench_column_encryption(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(TestClock::at_unix(1_700_000_000));
    let registry = Arc::new(StaticKeyRegistry::new(
        KeyVersion::new("v1").unwrap(),
        DataKey::generate(),
        clock,
    ));
    let engine = ColumnEncryptionEngine::new(registry);

    let mut group = c.benchmark_group("column_encryption");

    for size in [16, 256, 4096] {
        let plaintext = "x".repeat(size);
        let ciphertext = rt.block_on(engine.encrypt(&plaintext, None)).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &plaintext, |b, plaintext| {
            b.iter(|| rt.block_on(engine.encrypt(black_box(plaintext), None)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("decrypt", size), &ciphertext, |b, ciphertext| {
            b.iter(|| rt.block_on(engine.decrypt(black_box(ciphertext))).unwrap());
        });
    }

    group.finish();
}

/// Benchmarks a verified, admitted and audited webhook end to end.
fn bench_webhook_intake(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let env = TestEnv::new();
    let router = env.router();

    let mut group = c.benchmark_group("webhook_intake");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("unique_delivery", |b| {
        b.iter_batched(
            || WebhookBuilder::new().tenant("acme").body(random_payload(64)).build(),
            |request| rt.block_on(router.clone().oneshot(request)).unwrap(),
            BatchSize::SmallInput,
        );
    });

    let replay = WebhookBuilder::new().tenant("acme");
    let replay_signature = replay.signature_header().unwrap();
    rt.block_on(router.clone().oneshot(replay.build())).unwrap();

    group.bench_function("replayed_delivery", |b| {
        b.iter_batched(
            || WebhookBuilder::new().tenant("acme").signature(replay_signature.clone()).build(),
            |request| rt.block_on(router.clone().oneshot(request)).unwrap(),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_signatures, bench_column_encryption, bench_webhook_intake);
criterion_main!(benches);
