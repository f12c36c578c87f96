//! Shared state handed to every handler and middleware.
//!
//! Handlers never reach for the database directly. They go through the
//! guards and through two narrow traits, [`ArtifactCatalog`] and
//! [`ReadinessProbe`], so that the whole router can run against the
//! in-memory doubles in [`mock`].

use std::{future::Future, pin::Pin, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::http::HeaderName;
use palisade_core::{
    error::Result as CoreResult, storage::Storage, ArtifactId, Clock, EvidenceArtifact, TenantId,
};
use palisade_crypto::{EvidenceGate, FsObjectStore, GrantSigner, SignatureVerifier};
use palisade_guard::{AuditLogger, IdempotencyGuard, PostgresGuardStorage, RateLimiter};

use crate::config::Config;

/// Lookup of evidence artifact metadata.
pub trait ArtifactCatalog: Send + Sync + 'static {
    /// Returns the artifact if it exists and belongs to `tenant_id`.
    fn find_for_tenant(
        &self,
        tenant_id: TenantId,
        id: ArtifactId,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Option<EvidenceArtifact>>> + Send + '_>>;
}

/// Dependency check behind `/health` and `/ready`.
pub trait ReadinessProbe: Send + Sync + 'static {
    /// Succeeds when the backing store answers.
    fn check(&self) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>>;
}

impl ArtifactCatalog for Storage {
    fn find_for_tenant(
        &self,
        tenant_id: TenantId,
        id: ArtifactId,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Option<EvidenceArtifact>>> + Send + '_>> {
        Box::pin(async move { self.evidence_artifacts.find_for_tenant(&tenant_id, id).await })
    }
}

impl ReadinessProbe for Storage {
    fn check(&self) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        Box::pin(self.health_check())
    }
}

/// Request-level knobs read by the middleware.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Header carrying the webhook timestamp.
    pub timestamp_header: HeaderName,
    /// Header carrying the webhook signature.
    pub signature_header: HeaderName,
    /// Header naming the calling tenant.
    pub tenant_header: HeaderName,
    /// Largest accepted webhook body.
    pub max_body_bytes: usize,
    /// Requests per key per minute on rate-limited routes.
    pub rate_limit_per_minute: u64,
    /// Lifetime of evidence grants.
    pub grant_ttl: Duration,
    /// Deadline for a whole request.
    pub request_timeout: Duration,
    /// Deadline for store lookups made directly by handlers.
    pub store_timeout: Duration,
}

impl HttpSettings {
    /// Reads the settings out of the service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured header name is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let header = |name: &str| {
            HeaderName::from_str(name).with_context(|| format!("invalid header name {name:?}"))
        };

        Ok(Self {
            timestamp_header: header(&config.webhook_timestamp_header)?,
            signature_header: header(&config.webhook_signature_header)?,
            tenant_header: header(&config.tenant_header)?,
            max_body_bytes: config.max_body_bytes,
            rate_limit_per_minute: config.rate_limit_per_minute,
            grant_ttl: config.grant_ttl(),
            request_timeout: config.request_timeout(),
            store_timeout: config.store_timeout(),
        })
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timestamp_header: HeaderName::from_static("x-webhook-timestamp"),
            signature_header: HeaderName::from_static("x-webhook-signature"),
            tenant_header: HeaderName::from_static("x-tenant-id"),
            max_body_bytes: 1024 * 1024,
            rate_limit_per_minute: 120,
            grant_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            store_timeout: palisade_guard::timeout::DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Everything a request needs, cloned cheaply into each handler.
#[derive(Clone)]
pub struct AppState {
    /// Request-level settings.
    pub settings: Arc<HttpSettings>,
    /// Webhook signature verifier.
    pub verifier: SignatureVerifier,
    /// Replay guard for verified webhooks.
    pub idempotency: IdempotencyGuard,
    /// Per-tenant request limiter.
    pub rate_limiter: RateLimiter,
    /// Audit trail writer.
    pub audit: AuditLogger,
    /// Evidence integrity check and grant issuer.
    pub evidence: EvidenceGate,
    /// Evidence metadata lookup.
    pub artifacts: Arc<dyn ArtifactCatalog>,
    /// Dependency check for readiness.
    pub probe: Arc<dyn ReadinessProbe>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires the production state over PostgreSQL and the filesystem
    /// evidence store.
    ///
    /// # Errors
    ///
    /// Returns an error if a required secret is missing or a header name
    /// is invalid.
    pub fn from_config(
        config: &Config,
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must be set");
        }
        if config.signed_url_secret.is_empty() {
            anyhow::bail!("SIGNED_URL_SECRET must be set");
        }

        let store_timeout = config.store_timeout();
        let guards = Arc::new(PostgresGuardStorage::new(storage.clone()));

        let verifier = SignatureVerifier::new(
            config.webhook_secret.expose().as_bytes(),
            config.webhook_max_skew_seconds,
            clock.clone(),
        );
        let idempotency =
            IdempotencyGuard::new(guards.clone(), clock.clone()).with_timeout(store_timeout);
        let rate_limiter =
            RateLimiter::new(guards.clone(), clock.clone(), config.rate_limit_failure_mode)
                .with_timeout(store_timeout);
        let audit = AuditLogger::new(guards, config.audit_mode).with_timeout(store_timeout);
        let evidence = EvidenceGate::new(
            Arc::new(FsObjectStore::new(&config.evidence_root)),
            GrantSigner::new(config.signed_url_secret.expose().as_bytes(), &config.signed_url_base),
            clock.clone(),
        );

        Ok(Self {
            settings: Arc::new(HttpSettings::from_config(config)?),
            verifier,
            idempotency,
            rate_limiter,
            audit,
            evidence,
            artifacts: storage.clone(),
            probe: storage,
            clock,
        })
    }
}

pub mod mock {
    //! In-memory artifact catalog and readiness probe for router tests.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use palisade_core::{error::Result, ArtifactId, CoreError, EvidenceArtifact, TenantId};
    use tokio::sync::RwLock;

    use super::{ArtifactCatalog, ReadinessProbe};

    /// Artifact metadata held in memory.
    #[derive(Clone, Default)]
    pub struct MemoryArtifactCatalog {
        artifacts: Arc<RwLock<HashMap<ArtifactId, EvidenceArtifact>>>,
    }

    impl MemoryArtifactCatalog {
        /// Creates an empty catalog.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an artifact.
        pub async fn insert(&self, artifact: EvidenceArtifact) {
            self.artifacts.write().await.insert(artifact.id, artifact);
        }
    }

    impl ArtifactCatalog for MemoryArtifactCatalog {
        fn find_for_tenant(
            &self,
            tenant_id: TenantId,
            id: ArtifactId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<EvidenceArtifact>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self
                    .artifacts
                    .read()
                    .await
                    .get(&id)
                    .filter(|artifact| artifact.tenant_id == tenant_id)
                    .cloned())
            })
        }
    }

    /// Probe whose answer is set by the test.
    #[derive(Clone)]
    pub struct StaticProbe {
        healthy: Arc<AtomicBool>,
    }

    impl StaticProbe {
        /// Creates a healthy probe.
        pub fn new() -> Self {
            Self { healthy: Arc::new(AtomicBool::new(true)) }
        }

        /// Flips the reported health.
        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    impl Default for StaticProbe {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ReadinessProbe for StaticProbe {
        fn check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let healthy = self.healthy.load(Ordering::SeqCst);
            Box::pin(async move {
                if healthy {
                    Ok(())
                } else {
                    Err(CoreError::Unavailable("probe reports store down".to_string()))
                }
            })
        }
    }
}
