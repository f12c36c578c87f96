//! Evidence integrity check and time-limited access grants.
//!
//! Before a download link for an evidence artifact is issued, the stored
//! bytes are fetched and re-hashed. The fresh SHA-256 must equal the hash
//! recorded when the artifact was created; otherwise no grant is issued.
//! Grants are URLs carrying an expiry and an HMAC-SHA256 over
//! `path + "\n" + expires`. Each path segment is percent-encoded in the URL;
//! the MAC covers the decoded path.

use std::{
    collections::HashMap,
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use palisade_core::{Clock, EvidenceArtifact};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default deadline for object store reads.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Read access to stored artifact bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Returns the bytes stored at `path`.
    async fn fetch(&self, path: &str) -> Result<Bytes>;
}

/// Object store over a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let is_plain = !path.is_empty()
            && relative.components().all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(CryptoError::ObjectStore(format!("path escapes evidence root: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve(path)?;
        let bytes = tokio::fs::read(&full_path)
            .await
            .map_err(|e| CryptoError::ObjectStore(format!("failed to read {path}: {e}")))?;
        Ok(Bytes::from(bytes))
    }
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` at `path`, replacing any previous object.
    pub async fn put(&self, path: impl Into<String>, bytes: impl Into<Bytes>) {
        self.objects.write().await.insert(path.into(), bytes.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| CryptoError::ObjectStore(format!("no object at {path}")))
    }
}

/// Time-limited access URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedGrant {
    /// URL including `expires` and `signature` query parameters.
    pub url: String,
    /// Instant after which the URL is rejected.
    pub expires_at: DateTime<Utc>,
}

/// Signs and validates access URLs.
#[derive(Clone)]
pub struct GrantSigner {
    secret: Arc<Zeroizing<Vec<u8>>>,
    base_url: String,
}

impl GrantSigner {
    /// Creates a signer issuing URLs under `base_url`.
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { secret: Arc::new(Zeroizing::new(secret.into())), base_url }
    }

    /// Signs access to `path` until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidGrant` if the signing secret is empty.
    pub fn sign(&self, path: &str, expires_at: DateTime<Utc>) -> Result<SignedGrant> {
        let expires = expires_at.timestamp();
        let mac = self.mac(path, expires)?;
        let signature = hex::encode(mac.finalize().into_bytes());
        let url = format!(
            "{}/{}?expires={expires}&signature={signature}",
            self.base_url,
            encode_path(path)
        );
        Ok(SignedGrant { url, expires_at })
    }

    /// Validates a URL issued by [`GrantSigner::sign`] at time `now`
    /// (unix seconds) and returns the granted path.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidGrant` for foreign, malformed, expired
    /// or forged URLs.
    pub fn verify(&self, url: &str, now: i64) -> Result<String> {
        let invalid = |reason: &str| CryptoError::InvalidGrant(reason.to_string());

        let rest = url
            .strip_prefix(self.base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| invalid("url not issued by this signer"))?;
        let (encoded, query) = rest.split_once('?').ok_or_else(|| invalid("missing query"))?;
        let path = decode_path(encoded).ok_or_else(|| invalid("path is not valid UTF-8"))?;

        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires = Some(value),
                Some(("signature", value)) => signature = Some(value),
                _ => {},
            }
        }

        let expires: i64 = expires
            .ok_or_else(|| invalid("missing expires"))?
            .parse()
            .map_err(|_| invalid("expires is not a timestamp"))?;
        let signature = hex::decode(signature.ok_or_else(|| invalid("missing signature"))?)
            .map_err(|_| invalid("signature is not hex"))?;

        if now > expires {
            return Err(invalid("grant expired"));
        }

        self.mac(&path, expires)?
            .verify_slice(&signature)
            .map_err(|_| invalid("signature mismatch"))?;

        Ok(path)
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256> {
        if self.secret.is_empty() {
            return Err(CryptoError::InvalidGrant("signing secret is empty".to_string()));
        }
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| CryptoError::InvalidGrant("invalid signing secret".to_string()))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}

fn encode_path(path: &str) -> String {
    path.split('/').map(urlencoding::encode).collect::<Vec<_>>().join("/")
}

fn decode_path(encoded: &str) -> Option<String> {
    encoded
        .split('/')
        .map(|segment| urlencoding::decode(segment).ok().map(|s| s.into_owned()))
        .collect::<Option<Vec<_>>>()
        .map(|segments| segments.join("/"))
}

impl fmt::Debug for GrantSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantSigner")
            .field("base_url", &self.base_url)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Issues access grants only for artifacts whose bytes still match their
/// recorded hash.
#[derive(Debug, Clone)]
pub struct EvidenceGate {
    store: Arc<dyn ObjectStore>,
    signer: GrantSigner,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
}

impl EvidenceGate {
    /// Creates a gate with the default fetch deadline.
    pub fn new(store: Arc<dyn ObjectStore>, signer: GrantSigner, clock: Arc<dyn Clock>) -> Self {
        Self { store, signer, clock, fetch_timeout: DEFAULT_FETCH_TIMEOUT }
    }

    /// Overrides the object store deadline.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Re-hashes the artifact and, if it matches, returns a grant valid
    /// for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::IntegrityMismatch` when the bytes no longer
    /// match, `CryptoError::Timeout` or `CryptoError::ObjectStore` when the
    /// bytes cannot be fetched.
    #[instrument(skip(self, artifact), fields(artifact_id = %artifact.id))]
    pub async fn grant(&self, artifact: &EvidenceArtifact, ttl: Duration) -> Result<SignedGrant> {
        self.verify_integrity(artifact).await?;

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| CryptoError::InvalidGrant("grant lifetime out of range".to_string()))?;
        let expires_at = self.clock.now_utc() + ttl;
        let grant = self.signer.sign(&artifact.path, expires_at)?;

        debug!(expires_at = %grant.expires_at, "issued evidence grant");
        Ok(grant)
    }

    /// Recomputes the artifact hash and compares it in constant time.
    ///
    /// # Errors
    ///
    /// See [`EvidenceGate::grant`].
    pub async fn verify_integrity(&self, artifact: &EvidenceArtifact) -> Result<()> {
        let bytes = tokio::time::timeout(self.fetch_timeout, self.store.fetch(&artifact.path))
            .await
            .map_err(|_| CryptoError::Timeout(self.fetch_timeout))??;

        let fresh = Sha256::digest(&bytes);
        let recorded = hex::decode(artifact.sha256.trim()).unwrap_or_default();

        if recorded.len() != fresh.len() || !bool::from(fresh.as_slice().ct_eq(&recorded)) {
            warn!(path = %artifact.path, "evidence hash mismatch");
            return Err(CryptoError::IntegrityMismatch { artifact_id: artifact.id.to_string() });
        }
        Ok(())
    }

    /// Validates a grant URL against the gate's clock.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidGrant` if the URL is expired or forged.
    pub fn verify_grant(&self, url: &str) -> Result<String> {
        self.signer.verify(url, self.clock.unix_seconds())
    }
}
