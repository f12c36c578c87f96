//! Test data builders and fixtures.
//!
//! Signed webhook requests, evidence artifacts with matching hashes, and
//! random payloads for load-style tests.

use axum::{
    body::Body,
    http::{header, Method, Request},
};
use chrono::Utc;
use palisade_core::{ArtifactId, EvidenceArtifact, TenantId};
use palisade_crypto::sign;
use rand::{distr::Alphanumeric, Rng};
use serde_json::json;

/// Shared secret the test environment verifies webhooks with.
pub const WEBHOOK_SECRET: &[u8] = b"whsec_palisade_test_secret";

/// Secret the test environment signs evidence grants with.
pub const GRANT_SECRET: &[u8] = b"grant_palisade_test_secret";

/// Base URL of grants issued in tests.
pub const GRANT_BASE_URL: &str = "https://evidence.test/files";

/// Unix time the test clock starts at; 20 seconds into a UTC minute.
pub const START_UNIX: u64 = 1_700_000_000;

/// Builder for webhook requests against `/webhooks/ingest`.
pub struct WebhookBuilder {
    body: Vec<u8>,
    timestamp: Option<String>,
    signature: Option<String>,
    secret: Vec<u8>,
    tenant: Option<String>,
    user_agent: Option<String>,
}

impl WebhookBuilder {
    /// Starts a webhook with a JSON body, timestamped at [`START_UNIX`].
    pub fn new() -> Self {
        Self {
            body: br#"{"event":"invoice.paid","amount":4200}"#.to_vec(),
            timestamp: Some(START_UNIX.to_string()),
            signature: None,
            secret: WEBHOOK_SECRET.to_vec(),
            tenant: None,
            user_agent: Some("palisade-test/1.0".to_string()),
        }
    }

    /// Sets the raw body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the timestamp header; `None` omits it.
    #[must_use]
    pub fn timestamp(mut self, timestamp: Option<&str>) -> Self {
        self.timestamp = timestamp.map(str::to_string);
        self
    }

    /// Overrides the computed signature header.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Signs with a different secret.
    #[must_use]
    pub fn secret(mut self, secret: &[u8]) -> Self {
        self.secret = secret.to_vec();
        self
    }

    /// Sets the tenant header.
    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Signature header value this builder will send.
    pub fn signature_header(&self) -> Option<String> {
        if let Some(signature) = &self.signature {
            return Some(signature.clone());
        }
        let timestamp = self.timestamp.as_deref()?;
        sign(&self.body, timestamp, &self.secret).ok()
    }

    /// Builds the HTTP request.
    pub fn build(self) -> Request<Body> {
        let signature = self.signature_header();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/ingest")
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(timestamp) = &self.timestamp {
            builder = builder.header("x-webhook-timestamp", timestamp);
        }
        if let Some(signature) = signature {
            builder = builder.header("x-webhook-signature", signature);
        }
        if let Some(tenant) = &self.tenant {
            builder = builder.header("x-tenant-id", tenant);
        }
        if let Some(agent) = &self.user_agent {
            builder = builder.header(header::USER_AGENT, agent);
        }

        builder.body(Body::from(self.body)).unwrap_or_else(|_| Request::new(Body::empty()))
    }
}

impl Default for WebhookBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds an artifact record whose hash matches `bytes`.
pub fn artifact(tenant: &str, path: &str, bytes: &[u8]) -> EvidenceArtifact {
    EvidenceArtifact {
        id: ArtifactId::new(),
        tenant_id: TenantId::new(tenant).unwrap_or_else(TenantId::public),
        path: path.to_string(),
        sha256: sha256::digest(bytes),
        created_at: Utc::now(),
    }
}

/// Request for a grant on `artifact_id`, optionally as `tenant`.
pub fn grant_request(artifact_id: ArtifactId, tenant: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(format!("/evidence/{artifact_id}/grant"))
        .header("x-api-key", "sk_test_0123456789abcdef");
    if let Some(tenant) = tenant {
        builder = builder.header("x-tenant-id", tenant);
    }
    builder.body(Body::empty()).unwrap_or_else(|_| Request::new(Body::empty()))
}

/// JSON webhook body with a random reference of `len` characters.
pub fn random_payload(len: usize) -> Vec<u8> {
    let reference: String =
        rand::rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect();
    json!({ "event": "charge.succeeded", "reference": reference }).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use palisade_crypto::verify_at;

    use super::*;

    #[test]
    fn builder_signs_its_body() {
        let builder = WebhookBuilder::new().body(b"{\"a\":1}".to_vec());
        let signature = builder.signature_header().unwrap();

        assert!(verify_at(
            b"{\"a\":1}",
            Some("1700000000"),
            Some(&signature),
            WEBHOOK_SECRET,
            300,
            1_700_000_000,
        ));
    }

    #[test]
    fn artifact_hash_is_lowercase_hex() {
        let artifact = artifact("acme", "acme/a.pdf", b"bytes");
        assert_eq!(artifact.sha256.len(), 64);
        assert!(artifact.sha256.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn random_payloads_differ() {
        assert_ne!(random_payload(16), random_payload(16));
    }
}
