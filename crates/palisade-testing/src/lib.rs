//! Test infrastructure for deterministic palisade tests.
//!
//! [`TestEnv`] wires every component against in-memory doubles and a
//! controllable clock, so the full router can be driven without a
//! database. Store failures and latency are injected through the doubles.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use axum::Router;
use palisade_api::{
    create_router,
    state::mock::{MemoryArtifactCatalog, StaticProbe},
    AppState, HttpSettings,
};
use palisade_core::{AuditLogEntry, Clock, EvidenceArtifact, TenantId, TestClock};
use palisade_crypto::{
    ColumnEncryptionEngine, DataKey, EvidenceGate, GrantSigner, KeyVersion, MemoryObjectStore,
    SignatureVerifier, StaticKeyRegistry,
};
use palisade_guard::{
    storage::mock::MockGuardStorage, AuditLogger, AuditMode, FailureMode, IdempotencyGuard,
    RateLimiter,
};

pub mod fixtures;

pub use fixtures::{artifact, grant_request, random_payload, WebhookBuilder};

/// Key version the environment's registry starts with.
pub const INITIAL_KEY_VERSION: &str = "v1";

/// Builder for [`TestEnv`].
pub struct TestEnvBuilder {
    failure_mode: FailureMode,
    audit_mode: AuditMode,
    rate_limit_per_minute: u64,
    max_body_bytes: usize,
    max_skew_seconds: u64,
    store_timeout: Duration,
}

impl TestEnvBuilder {
    /// Creates a builder with defaults matching the service defaults.
    pub fn new() -> Self {
        let settings = HttpSettings::default();
        Self {
            failure_mode: FailureMode::Open,
            audit_mode: AuditMode::BestEffort,
            rate_limit_per_minute: settings.rate_limit_per_minute,
            max_body_bytes: settings.max_body_bytes,
            max_skew_seconds: 300,
            store_timeout: Duration::from_millis(200),
        }
    }

    /// Sets the rate limiter's store-failure behaviour.
    #[must_use]
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Sets the audit failure policy.
    #[must_use]
    pub fn audit_mode(mut self, mode: AuditMode) -> Self {
        self.audit_mode = mode;
        self
    }

    /// Sets the per-minute request ceiling.
    #[must_use]
    pub fn rate_limit(mut self, per_minute: u64) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    /// Sets the webhook body limit.
    #[must_use]
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Sets the accepted webhook timestamp skew.
    #[must_use]
    pub fn max_skew_seconds(mut self, seconds: u64) -> Self {
        self.max_skew_seconds = seconds;
        self
    }

    /// Sets the deadline of every store call.
    #[must_use]
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Wires the environment.
    pub fn build(self) -> TestEnv {
        let clock = TestClock::at_unix(fixtures::START_UNIX);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let guards = MockGuardStorage::new();
        let objects = Arc::new(MemoryObjectStore::new());
        let artifacts = MemoryArtifactCatalog::new();
        let probe = StaticProbe::new();

        let version = KeyVersion::new(INITIAL_KEY_VERSION).expect("valid key version");
        let keys =
            Arc::new(StaticKeyRegistry::new(version, DataKey::generate(), shared_clock.clone()));
        let engine = ColumnEncryptionEngine::new(keys.clone());

        let settings = HttpSettings {
            max_body_bytes: self.max_body_bytes,
            rate_limit_per_minute: self.rate_limit_per_minute,
            store_timeout: self.store_timeout,
            ..HttpSettings::default()
        };

        let state = AppState {
            settings: Arc::new(settings),
            verifier: SignatureVerifier::new(
                fixtures::WEBHOOK_SECRET,
                self.max_skew_seconds,
                shared_clock.clone(),
            ),
            idempotency: IdempotencyGuard::new(Arc::new(guards.clone()), shared_clock.clone())
                .with_timeout(self.store_timeout),
            rate_limiter: RateLimiter::new(
                Arc::new(guards.clone()),
                shared_clock.clone(),
                self.failure_mode,
            )
            .with_timeout(self.store_timeout),
            audit: AuditLogger::new(Arc::new(guards.clone()), self.audit_mode)
                .with_timeout(self.store_timeout),
            evidence: EvidenceGate::new(
                objects.clone(),
                GrantSigner::new(fixtures::GRANT_SECRET, fixtures::GRANT_BASE_URL),
                shared_clock.clone(),
            )
            .with_fetch_timeout(self.store_timeout),
            artifacts: Arc::new(artifacts.clone()),
            probe: Arc::new(probe.clone()),
            clock: shared_clock,
        };

        TestEnv { clock, guards, objects, artifacts, probe, keys, engine, state }
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory environment exposing every double for assertions and fault
/// injection.
pub struct TestEnv {
    /// Deterministic clock shared by every component.
    pub clock: TestClock,
    /// Replay, rate-limit and audit storage.
    pub guards: MockGuardStorage,
    /// Evidence bytes.
    pub objects: Arc<MemoryObjectStore>,
    /// Evidence metadata.
    pub artifacts: MemoryArtifactCatalog,
    /// Readiness probe.
    pub probe: StaticProbe,
    /// Key registry behind [`TestEnv::engine`].
    pub keys: Arc<StaticKeyRegistry>,
    /// Column encryption engine over [`TestEnv::keys`].
    pub engine: ColumnEncryptionEngine,
    /// Application state used by [`TestEnv::router`].
    pub state: AppState,
}

impl TestEnv {
    /// Creates an environment with default settings.
    pub fn new() -> Self {
        TestEnvBuilder::new().build()
    }

    /// Returns a builder for custom settings.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Router over this environment's state.
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Advances the shared clock.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Stores `bytes` and registers a matching artifact for `tenant`.
    pub async fn store_artifact(
        &self,
        tenant: &str,
        path: &str,
        bytes: &[u8],
    ) -> EvidenceArtifact {
        let artifact = fixtures::artifact(tenant, path, bytes);
        self.objects.put(path, bytes.to_vec()).await;
        self.artifacts.insert(artifact.clone()).await;
        artifact
    }

    /// Replaces the stored bytes at `path` without touching the recorded
    /// hash.
    pub async fn tamper_object(&self, path: &str, bytes: &[u8]) {
        self.objects.put(path, bytes.to_vec()).await;
    }

    /// Audit entries of `tenant` in append order.
    pub async fn audit_trail(&self, tenant: &str) -> Vec<AuditLogEntry> {
        let tenant = TenantId::new(tenant).unwrap_or_else(TenantId::public);
        self.guards
            .audit_entries()
            .await
            .into_iter()
            .filter(|entry| entry.tenant_id == tenant)
            .collect()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
