//! Core domain models and strongly-typed identifiers.
//!
//! Defines tenant and artifact identifiers, rate-limit identities and
//! buckets, idempotency records, the hash-chained audit log entry and the
//! evidence artifact record. Identifiers implement the sqlx traits so
//! repositories can bind them directly.

use std::{fmt, str::FromStr};

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Tenant used when a request carries no tenant header.
pub const PUBLIC_TENANT: &str = "public";

/// Credential fingerprint used when a request carries no API key or token.
pub const ANONYMOUS_CREDENTIAL: &str = "anonymous";

/// Number of trailing credential characters kept in a rate-limit key.
pub const CREDENTIAL_FINGERPRINT_LEN: usize = 12;

/// Hash preceding the first audit entry of every tenant chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Strongly-typed tenant identifier.
///
/// Tenants are supplied by callers as opaque strings (header values, JWT
/// claims), so this wraps a trimmed, non-empty string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant identifier, rejecting blank values.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// Returns the tenant used for unidentified traffic.
    pub fn public() -> Self {
        Self(PUBLIC_TENANT.to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl sqlx::Type<PgDb> for TenantId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TenantId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Self::new(raw).ok_or_else(|| "empty tenant identifier".into())
    }
}

impl sqlx::Encode<'_, PgDb> for TenantId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed evidence artifact identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    /// Creates a new random artifact ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ArtifactId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for ArtifactId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ArtifactId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ArtifactId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identity a request is throttled under.
///
/// Formed as `tenant + ':' + fingerprint` where the fingerprint is the last
/// twelve characters of the caller's API key or bearer token. Only the tail
/// of the credential is kept so full secrets never reach the bucket table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Derives the key from an optional tenant and an optional credential.
    ///
    /// A blank tenant falls back to [`PUBLIC_TENANT`], a blank credential to
    /// [`ANONYMOUS_CREDENTIAL`].
    pub fn from_parts(tenant: Option<&str>, credential: Option<&str>) -> Self {
        let tenant = tenant
            .and_then(TenantId::new)
            .unwrap_or_else(TenantId::public);
        let credential = credential.map(str::trim).filter(|c| !c.is_empty());
        let fingerprint = credential.map_or(ANONYMOUS_CREDENTIAL, credential_fingerprint);

        Self(format!("{tenant}:{fingerprint}"))
    }

    /// Wraps an already-derived key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the trailing fingerprint of a credential, counted in characters.
pub fn credential_fingerprint(credential: &str) -> &str {
    let count = credential.chars().count();
    if count <= CREDENTIAL_FINGERPRINT_LEN {
        return credential;
    }
    let skip = count - CREDENTIAL_FINGERPRINT_LEN;
    let start = credential.char_indices().nth(skip).map_or(0, |(idx, _)| idx);
    &credential[start..]
}

/// Request counter for one key in one fixed minute window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitBucket {
    /// Throttling identity.
    pub key: String,
    /// Start of the UTC minute this bucket counts.
    pub window_start: DateTime<Utc>,
    /// Requests seen in the window so far.
    pub count: i64,
}

/// Durable replay marker for a processed webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    /// Signature header value of the admitted request.
    pub signature: String,
    /// When the signature was first admitted.
    pub first_seen_at: DateTime<Utc>,
}

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    /// Action completed.
    Success,
    /// Action was attempted and failed.
    Failure,
    /// Action was refused by a security check.
    Denied,
}

impl AuditResult {
    /// Returns the stored representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown audit result: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for AuditResult {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AuditResult {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for AuditResult {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Caller-supplied description of a security-relevant action.
///
/// `old_value` and `new_value` are opaque snapshots; they are persisted
/// as-is and only participate in the entry hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Tenant the action belongs to.
    pub tenant_id: TenantId,
    /// Acting user, if known.
    pub user_id: Option<String>,
    /// Dotted action name, for example `webhook.received`.
    pub action: String,
    /// Resource type acted on.
    pub resource: String,
    /// Identifier of the resource acted on.
    pub resource_id: Option<String>,
    /// Client address.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Snapshot before the action.
    pub old_value: Option<serde_json::Value>,
    /// Snapshot after the action.
    pub new_value: Option<serde_json::Value>,
    /// Outcome of the action.
    pub result: AuditResult,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Starts an event with the mandatory fields and `Success` result.
    pub fn new(
        tenant_id: TenantId,
        action: impl Into<String>,
        resource: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            user_id: None,
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            ip: None,
            user_agent: None,
            old_value: None,
            new_value: None,
            result: AuditResult::Success,
            timestamp,
        }
    }

    /// Sets the resource identifier.
    #[must_use]
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets client address and user agent.
    #[must_use]
    pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    /// Sets the before/after snapshots.
    #[must_use]
    pub fn with_change(
        mut self,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub fn with_result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }
}

/// Persisted, hash-chained audit record.
///
/// Entries are never updated or deleted. Each entry commits to the hash of
/// the previous entry of the same tenant, so edits, removals and reorders
/// are detectable with [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique entry identifier.
    pub id: Uuid,
    /// Tenant the action belongs to.
    pub tenant_id: TenantId,
    /// Acting user, if known.
    pub user_id: Option<String>,
    /// Dotted action name.
    pub action: String,
    /// Resource type acted on.
    pub resource: String,
    /// Identifier of the resource acted on.
    pub resource_id: Option<String>,
    /// Client address.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Snapshot before the action.
    pub old_value: Option<serde_json::Value>,
    /// Snapshot after the action.
    pub new_value: Option<serde_json::Value>,
    /// Outcome of the action.
    pub result: AuditResult,
    /// When the action happened, at microsecond precision.
    pub timestamp: DateTime<Utc>,
    /// Hash of the preceding entry in this tenant's chain.
    pub prev_hash: String,
    /// Hash of this entry.
    pub entry_hash: String,
}

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: &'a Uuid,
    tenant_id: &'a str,
    user_id: Option<&'a str>,
    action: &'a str,
    resource: &'a str,
    resource_id: Option<&'a str>,
    ip: Option<&'a str>,
    user_agent: Option<&'a str>,
    old_value: Option<&'a serde_json::Value>,
    new_value: Option<&'a serde_json::Value>,
    result: &'a str,
    timestamp: String,
}

impl AuditLogEntry {
    /// Seals an event into a chained entry following `prev_hash`.
    pub fn seal(event: AuditEvent, id: Uuid, prev_hash: impl Into<String>) -> Self {
        // Postgres keeps microseconds; hashing finer precision would break
        // verification after a round trip.
        let timestamp =
            event.timestamp.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(event.timestamp);

        let mut entry = Self {
            id,
            tenant_id: event.tenant_id,
            user_id: event.user_id,
            action: event.action,
            resource: event.resource,
            resource_id: event.resource_id,
            ip: event.ip,
            user_agent: event.user_agent,
            old_value: event.old_value,
            new_value: event.new_value,
            result: event.result,
            timestamp,
            prev_hash: prev_hash.into(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }

    /// Recomputes this entry's hash from its fields and `prev_hash`.
    pub fn compute_hash(&self) -> String {
        let canonical = CanonicalEntry {
            id: &self.id,
            tenant_id: self.tenant_id.as_str(),
            user_id: self.user_id.as_deref(),
            action: &self.action,
            resource: &self.resource,
            resource_id: self.resource_id.as_deref(),
            ip: self.ip.as_deref(),
            user_agent: self.user_agent.as_deref(),
            old_value: self.old_value.as_ref(),
            new_value: self.new_value.as_ref(),
            result: self.result.as_str(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        };
        // Serializing borrowed strings and json values cannot fail
        let body = serde_json::to_vec(&canonical).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

/// Reason an audit chain failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    /// Entry content no longer matches its stored hash.
    #[error("audit entry {index} ({id}) does not match its hash")]
    Tampered {
        /// Position in the verified slice.
        index: usize,
        /// Entry identifier.
        id: Uuid,
    },

    /// Entry does not follow the previous entry's hash.
    #[error("audit entry {index} ({id}) does not link to its predecessor")]
    BrokenLink {
        /// Position in the verified slice.
        index: usize,
        /// Entry identifier.
        id: Uuid,
    },

    /// Entries from more than one tenant were supplied.
    #[error("audit entry {index} belongs to a different tenant")]
    MixedTenants {
        /// Position in the verified slice.
        index: usize,
    },
}

/// Verifies a tenant's audit entries in append order, starting at genesis.
///
/// # Errors
///
/// Returns the first [`ChainViolation`] found.
pub fn verify_chain(entries: &[AuditLogEntry]) -> Result<(), ChainViolation> {
    let mut expected_prev = GENESIS_HASH;
    let tenant = entries.first().map(|e| &e.tenant_id);

    for (index, entry) in entries.iter().enumerate() {
        if Some(&entry.tenant_id) != tenant {
            return Err(ChainViolation::MixedTenants { index });
        }
        if entry.prev_hash != expected_prev {
            return Err(ChainViolation::BrokenLink { index, id: entry.id });
        }
        if entry.compute_hash() != entry.entry_hash {
            return Err(ChainViolation::Tampered { index, id: entry.id });
        }
        expected_prev = &entry.entry_hash;
    }

    Ok(())
}

/// Stored evidence object with the hash recorded at upload time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EvidenceArtifact {
    /// Artifact identifier.
    pub id: ArtifactId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Object store path, relative to the store root.
    pub path: String,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub sha256: String,
    /// When the artifact was registered.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn event(tenant: &str, action: &str, second: u32) -> AuditEvent {
        AuditEvent::new(
            TenantId::new(tenant).unwrap(),
            action,
            "webhook",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
        )
    }

    fn chain(events: Vec<AuditEvent>) -> Vec<AuditLogEntry> {
        let mut prev = GENESIS_HASH.to_string();
        events
            .into_iter()
            .map(|e| {
                let entry = AuditLogEntry::seal(e, Uuid::new_v4(), prev.clone());
                prev = entry.entry_hash.clone();
                entry
            })
            .collect()
    }

    #[test]
    fn tenant_id_rejects_blank() {
        assert!(TenantId::new("").is_none());
        assert!(TenantId::new("   ").is_none());
        assert_eq!(TenantId::new(" acme ").unwrap().as_str(), "acme");
    }

    #[test]
    fn rate_limit_key_keeps_credential_tail() {
        let key = RateLimitKey::from_parts(Some("acme"), Some("sk_live_0123456789abcdef"));
        assert_eq!(key.as_str(), "acme:456789abcdef");
    }

    #[test]
    fn rate_limit_key_uses_sentinels() {
        assert_eq!(RateLimitKey::from_parts(None, None).as_str(), "public:anonymous");
        assert_eq!(RateLimitKey::from_parts(Some(""), Some("  ")).as_str(), "public:anonymous");
    }

    #[test]
    fn short_credentials_are_kept_whole() {
        assert_eq!(RateLimitKey::from_parts(Some("t"), Some("abc")).as_str(), "t:abc");
    }

    #[test]
    fn fingerprint_counts_characters_not_bytes() {
        let credential = "ééééééééééééé1";
        assert_eq!(credential_fingerprint(credential).chars().count(), 12);
        assert!(credential_fingerprint(credential).ends_with('1'));
    }

    #[test]
    fn audit_result_round_trips_through_str() {
        for result in [AuditResult::Success, AuditResult::Failure, AuditResult::Denied] {
            assert_eq!(result.as_str().parse::<AuditResult>().unwrap(), result);
        }
        assert!("maybe".parse::<AuditResult>().is_err());
    }

    #[test]
    fn sealed_chain_verifies() {
        let entries = chain(vec![
            event("acme", "webhook.received", 1),
            event("acme", "evidence.granted", 2).with_change(None, Some(json!({"ttl": 300}))),
            event("acme", "key.retired", 3).with_result(AuditResult::Denied),
        ]);

        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].entry_hash);
        assert_eq!(verify_chain(&entries), Ok(()));
    }

    #[test]
    fn modified_entry_is_detected() {
        let mut entries = chain(vec![event("acme", "a", 1), event("acme", "b", 2)]);
        entries[0].action = "c".to_string();

        assert!(matches!(verify_chain(&entries), Err(ChainViolation::Tampered { index: 0, .. })));
    }

    #[test]
    fn removed_entry_is_detected() {
        let mut entries =
            chain(vec![event("acme", "a", 1), event("acme", "b", 2), event("acme", "c", 3)]);
        entries.remove(1);

        assert!(matches!(verify_chain(&entries), Err(ChainViolation::BrokenLink { index: 1, .. })));
    }

    #[test]
    fn reordered_entries_are_detected() {
        let mut entries = chain(vec![event("acme", "a", 1), event("acme", "b", 2)]);
        entries.swap(0, 1);

        assert!(verify_chain(&entries).is_err());
    }

    #[test]
    fn mixed_tenants_are_rejected() {
        let mut entries = chain(vec![event("acme", "a", 1)]);
        entries.extend(chain(vec![event("globex", "a", 1)]));

        assert_eq!(verify_chain(&entries), Err(ChainViolation::MixedTenants { index: 1 }));
    }

    #[test]
    fn seal_truncates_timestamp_to_microseconds() {
        let mut e = event("acme", "a", 1);
        e.timestamp += TimeDelta::nanoseconds(1_234_567);
        let entry = AuditLogEntry::seal(e, Uuid::new_v4(), GENESIS_HASH);

        assert_eq!(entry.timestamp.timestamp_subsec_nanos() % 1_000, 0);
        assert_eq!(entry.compute_hash(), entry.entry_hash);
    }
}
