//! Versioned key-encryption keys and the registries that resolve them.
//!
//! A registry knows which version is current for new writes and which
//! versions are still resolvable for reads. The current version is always
//! resolvable. Retired versions never resolve again.
//!
//! Two implementations ship:
//!
//! - [`EnvKeyRegistry`] reads `DATA_KEK_CURRENT`, `DATA_KEK_<version>` (base64
//!   of 32 bytes) and the comma separated `DATA_KEK_RETIRED` list.
//! - [`StaticKeyRegistry`] keeps keys in memory and supports install,
//!   promote and retire at runtime. Tests and embedders use it.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

use aes_gcm::{aead::OsRng, Aes256Gcm, KeyInit};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use palisade_core::Clock;
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// AES-256 key size in bytes.
pub const KEY_LEN: usize = 32;

/// Maximum length of a key version identifier.
pub const MAX_VERSION_LEN: usize = 32;

/// Environment variable naming the current version.
pub const ENV_CURRENT: &str = "DATA_KEK_CURRENT";

/// Environment variable listing retired versions.
pub const ENV_RETIRED: &str = "DATA_KEK_RETIRED";

/// Environment variable holding the RFC 3339 time the current version was
/// promoted.
pub const ENV_ROTATED_AT: &str = "DATA_KEK_ROTATED_AT";

/// Prefix of per-version key variables.
pub const ENV_KEY_PREFIX: &str = "DATA_KEK_";

/// Identifier of a key-encryption key version.
///
/// Restricted to `[A-Za-z0-9_-]{1,32}` so it is a valid environment
/// variable suffix and can never contain the `;` or `=` separators of the
/// encrypted value format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyVersion(String);

impl KeyVersion {
    /// Validates and wraps a version identifier.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyVersion` for empty, overlong or
    /// non-alphanumeric identifiers.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= MAX_VERSION_LEN
            && value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

        if valid {
            Ok(Self(value))
        } else {
            Err(CryptoError::InvalidKeyVersion(value))
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the environment variable holding this version's key.
    pub fn env_var(&self) -> String {
        format!("{ENV_KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KeyVersion {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// 256-bit data key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generates a fresh random key from the operating system CSPRNG.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self { bytes }
    }

    /// Decodes standard base64 key material for `version`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` when the text is not base64
    /// or does not decode to exactly 32 bytes.
    pub fn from_base64(version: &KeyVersion, encoded: &str) -> Result<Self> {
        let mut decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
            CryptoError::InvalidKeyMaterial {
                version: version.to_string(),
                reason: format!("base64 decode failed: {e}"),
            }
        })?;

        let result = <[u8; KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self::from_bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial {
                version: version.to_string(),
                reason: format!("expected {KEY_LEN} bytes, got {}", decoded.len()),
            });
        decoded.zeroize();
        result
    }

    /// Encodes the key as standard base64, for provisioning output.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// Source of versioned key-encryption keys.
#[async_trait]
pub trait KeyRegistry: Send + Sync + fmt::Debug {
    /// Version used for new writes.
    async fn current_version(&self) -> Result<KeyVersion>;

    /// Resolves the key for `version`.
    ///
    /// Fails with `KeyNotFound` when nothing is provisioned and `KeyRetired`
    /// when the version was retired.
    async fn resolve(&self, version: &KeyVersion) -> Result<Arc<DataKey>>;

    /// Every version that currently resolves, current included.
    async fn resolvable_versions(&self) -> Result<Vec<KeyVersion>>;

    /// When the current version was promoted, if known.
    async fn promoted_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Stops resolving `version`.
    ///
    /// Callers must go through [`crate::rotation::KeyRetirement`], which
    /// checks sweep completion and the grace window first.
    async fn retire(&self, version: &KeyVersion) -> Result<()>;
}

/// Registry backed by process environment variables.
///
/// Keys are read on first use and cached. Retirement at runtime is kept in
/// memory; operators persist it by adding the version to
/// `DATA_KEK_RETIRED`.
pub struct EnvKeyRegistry {
    cache: RwLock<HashMap<KeyVersion, Arc<DataKey>>>,
    retired: RwLock<HashSet<KeyVersion>>,
}

impl EnvKeyRegistry {
    /// Creates a registry, reading the retired list from the environment.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyVersion` if `DATA_KEK_RETIRED` holds
    /// an invalid identifier.
    pub fn from_env() -> Result<Self> {
        let retired = match std::env::var(ENV_RETIRED) {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(KeyVersion::new)
                .collect::<Result<HashSet<_>>>()?,
            Err(_) => HashSet::new(),
        };

        Ok(Self { cache: RwLock::new(HashMap::new()), retired: RwLock::new(retired) })
    }

    fn read_current() -> Result<KeyVersion> {
        let raw = std::env::var(ENV_CURRENT)
            .map_err(|_| CryptoError::KeyNotFound { version: ENV_CURRENT.to_string() })?;
        KeyVersion::new(raw.trim())
    }

    fn is_reserved(suffix: &str) -> bool {
        matches!(suffix, "CURRENT" | "RETIRED" | "ROTATED_AT")
    }
}

impl fmt::Debug for EnvKeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvKeyRegistry").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyRegistry for EnvKeyRegistry {
    async fn current_version(&self) -> Result<KeyVersion> {
        Self::read_current()
    }

    async fn resolve(&self, version: &KeyVersion) -> Result<Arc<DataKey>> {
        if self.retired.read().await.contains(version) {
            return Err(CryptoError::KeyRetired { version: version.to_string() });
        }
        if let Some(key) = self.cache.read().await.get(version) {
            return Ok(key.clone());
        }

        let encoded = std::env::var(version.env_var())
            .map_err(|_| CryptoError::KeyNotFound { version: version.to_string() })?;
        let key = Arc::new(DataKey::from_base64(version, &encoded)?);

        self.cache.write().await.insert(version.clone(), key.clone());
        Ok(key)
    }

    async fn resolvable_versions(&self) -> Result<Vec<KeyVersion>> {
        let retired = self.retired.read().await;
        let mut versions: BTreeSet<KeyVersion> = std::env::vars()
            .filter_map(|(name, _)| {
                let suffix = name.strip_prefix(ENV_KEY_PREFIX)?;
                if Self::is_reserved(suffix) {
                    return None;
                }
                KeyVersion::new(suffix).ok()
            })
            .filter(|v| !retired.contains(v))
            .collect();

        if let Ok(current) = Self::read_current() {
            if !retired.contains(&current) {
                versions.insert(current);
            }
        }
        Ok(versions.into_iter().collect())
    }

    async fn promoted_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(std::env::var(ENV_ROTATED_AT)
            .ok()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    async fn retire(&self, version: &KeyVersion) -> Result<()> {
        if Self::read_current().ok().as_ref() == Some(version) {
            return Err(CryptoError::RetirementBlocked {
                version: version.to_string(),
                reason: "version is current".to_string(),
            });
        }

        self.retired.write().await.insert(version.clone());
        self.cache.write().await.remove(version);
        warn!(
            version = %version,
            "key version retired in memory; add it to {ENV_RETIRED} to persist"
        );
        Ok(())
    }
}

#[derive(Debug)]
struct StaticState {
    keys: HashMap<KeyVersion, Arc<DataKey>>,
    current: KeyVersion,
    retired: HashSet<KeyVersion>,
    promoted_at: Option<DateTime<Utc>>,
}

/// In-memory registry with runtime install, promote and retire.
#[derive(Debug)]
pub struct StaticKeyRegistry {
    state: RwLock<StaticState>,
    clock: Arc<dyn Clock>,
}

impl StaticKeyRegistry {
    /// Creates a registry whose only and current version is `version`.
    pub fn new(version: KeyVersion, key: DataKey, clock: Arc<dyn Clock>) -> Self {
        let mut keys = HashMap::new();
        keys.insert(version.clone(), Arc::new(key));
        Self {
            state: RwLock::new(StaticState {
                keys,
                current: version,
                retired: HashSet::new(),
                promoted_at: None,
            }),
            clock,
        }
    }

    /// Makes `version` resolvable without changing the current version.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyRetired` if the version was retired before;
    /// retired versions are never reinstated.
    pub async fn install(&self, version: KeyVersion, key: DataKey) -> Result<()> {
        let mut state = self.state.write().await;
        if state.retired.contains(&version) {
            return Err(CryptoError::KeyRetired { version: version.to_string() });
        }
        state.keys.insert(version, Arc::new(key));
        Ok(())
    }

    /// Makes an installed version current for new writes.
    ///
    /// The previous current version stays resolvable.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyNotFound` if the version is not installed.
    pub async fn promote(&self, version: &KeyVersion) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.keys.contains_key(version) {
            return Err(CryptoError::KeyNotFound { version: version.to_string() });
        }
        if &state.current != version {
            info!(from = %state.current, to = %version, "promoted key version");
            state.current = version.clone();
            state.promoted_at = Some(self.clock.now_utc());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyRegistry for StaticKeyRegistry {
    async fn current_version(&self) -> Result<KeyVersion> {
        Ok(self.state.read().await.current.clone())
    }

    async fn resolve(&self, version: &KeyVersion) -> Result<Arc<DataKey>> {
        let state = self.state.read().await;
        if state.retired.contains(version) {
            return Err(CryptoError::KeyRetired { version: version.to_string() });
        }
        state
            .keys
            .get(version)
            .cloned()
            .ok_or_else(|| CryptoError::KeyNotFound { version: version.to_string() })
    }

    async fn resolvable_versions(&self) -> Result<Vec<KeyVersion>> {
        let state = self.state.read().await;
        let mut versions: Vec<KeyVersion> = state.keys.keys().cloned().collect();
        versions.sort();
        Ok(versions)
    }

    async fn promoted_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.read().await.promoted_at)
    }

    async fn retire(&self, version: &KeyVersion) -> Result<()> {
        let mut state = self.state.write().await;
        if &state.current == version {
            return Err(CryptoError::RetirementBlocked {
                version: version.to_string(),
                reason: "version is current".to_string(),
            });
        }
        state.keys.remove(version);
        state.retired.insert(version.clone());
        info!(version = %version, "retired key version");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use palisade_core::TestClock;
    use serial_test::serial;

    use super::*;

    fn version(v: &str) -> KeyVersion {
        KeyVersion::new(v).unwrap()
    }

    fn static_registry() -> StaticKeyRegistry {
        StaticKeyRegistry::new(version("v1"), DataKey::generate(), Arc::new(TestClock::new()))
    }

    /// Restores environment variables touched by a test on drop.
    struct EnvGuard(Vec<(String, Option<String>)>);

    impl EnvGuard {
        fn set(vars: &[(&str, &str)]) -> Self {
            let saved = vars
                .iter()
                .map(|(name, value)| {
                    let old = std::env::var(name).ok();
                    std::env::set_var(name, value);
                    ((*name).to_string(), old)
                })
                .collect();
            Self(saved)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, old) in &self.0 {
                match old {
                    Some(value) => std::env::set_var(name, value),
                    None => std::env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn key_version_validation() {
        assert!(KeyVersion::new("v1").is_ok());
        assert!(KeyVersion::new("2024-06_a").is_ok());
        assert!(KeyVersion::new("").is_err());
        assert!(KeyVersion::new("v;1").is_err());
        assert!(KeyVersion::new("v=1").is_err());
        assert!(KeyVersion::new("a".repeat(33)).is_err());
        assert_eq!(version("v7").env_var(), "DATA_KEK_v7");
    }

    #[test]
    fn data_key_base64_round_trip() {
        let key = DataKey::generate();
        let decoded = DataKey::from_base64(&version("v1"), &key.to_base64()).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());
    }

    #[test]
    fn data_key_rejects_wrong_length() {
        let err = DataKey::from_base64(&version("v1"), &STANDARD.encode([0u8; 16])).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyMaterial { .. }));
    }

    #[test]
    fn data_key_debug_is_redacted() {
        let key = DataKey::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "DataKey([REDACTED])");
    }

    #[tokio::test]
    async fn static_registry_promote_keeps_old_version_resolvable() {
        let registry = static_registry();
        registry.install(version("v2"), DataKey::generate()).await.unwrap();
        registry.promote(&version("v2")).await.unwrap();

        assert_eq!(registry.current_version().await.unwrap(), version("v2"));
        assert!(registry.resolve(&version("v1")).await.is_ok());
        assert!(registry.promoted_at().await.unwrap().is_some());
        assert_eq!(
            registry.resolvable_versions().await.unwrap(),
            vec![version("v1"), version("v2")]
        );
    }

    #[tokio::test]
    async fn static_registry_refuses_to_retire_current() {
        let registry = static_registry();
        let err = registry.retire(&version("v1")).await.unwrap_err();
        assert!(matches!(err, CryptoError::RetirementBlocked { .. }));
    }

    #[tokio::test]
    async fn retired_versions_never_resolve_again() {
        let registry = static_registry();
        registry.install(version("v2"), DataKey::generate()).await.unwrap();
        registry.promote(&version("v2")).await.unwrap();
        registry.retire(&version("v1")).await.unwrap();

        let err = registry.resolve(&version("v1")).await.unwrap_err();
        assert!(matches!(err, CryptoError::KeyRetired { .. }));

        let err = registry.install(version("v1"), DataKey::generate()).await.unwrap_err();
        assert!(matches!(err, CryptoError::KeyRetired { .. }));
    }

    #[tokio::test]
    async fn unknown_version_is_key_not_found() {
        let registry = static_registry();
        let err = registry.resolve(&version("v9")).await.unwrap_err();
        assert!(matches!(err, CryptoError::KeyNotFound { version } if version == "v9"));
    }

    #[tokio::test]
    #[serial]
    async fn env_registry_resolves_from_environment() {
        let v1 = DataKey::generate();
        let v2 = DataKey::generate();
        let _guard = EnvGuard::set(&[
            ("DATA_KEK_CURRENT", "kt2"),
            ("DATA_KEK_kt1", &v1.to_base64()),
            ("DATA_KEK_kt2", &v2.to_base64()),
            ("DATA_KEK_RETIRED", "kt0"),
        ]);

        let registry = EnvKeyRegistry::from_env().unwrap();
        assert_eq!(registry.current_version().await.unwrap(), version("kt2"));
        assert_eq!(registry.resolve(&version("kt1")).await.unwrap().as_bytes(), v1.as_bytes());

        let versions = registry.resolvable_versions().await.unwrap();
        assert!(versions.contains(&version("kt1")));
        assert!(versions.contains(&version("kt2")));
        assert!(!versions.iter().any(|v| v.as_str() == "CURRENT" || v.as_str() == "RETIRED"));

        let err = registry.resolve(&version("kt0")).await.unwrap_err();
        assert!(matches!(err, CryptoError::KeyRetired { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn env_registry_missing_key_is_configuration_error() {
        let _guard = EnvGuard::set(&[("DATA_KEK_CURRENT", "kt5")]);
        let registry = EnvKeyRegistry::from_env().unwrap();

        let err = registry.resolve(&version("kt5")).await.unwrap_err();
        assert!(matches!(err, CryptoError::KeyNotFound { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn env_registry_never_lists_a_retired_current_version() {
        let _guard = EnvGuard::set(&[
            ("DATA_KEK_CURRENT", "kt3"),
            ("DATA_KEK_kt3", &DataKey::generate().to_base64()),
            ("DATA_KEK_kt4", &DataKey::generate().to_base64()),
            ("DATA_KEK_RETIRED", "kt3"),
        ]);
        let registry = EnvKeyRegistry::from_env().unwrap();

        let versions = registry.resolvable_versions().await.unwrap();
        assert!(!versions.contains(&version("kt3")));
        assert!(versions.contains(&version("kt4")));
        for v in &versions {
            registry.resolve(v).await.unwrap();
        }
    }

    #[tokio::test]
    #[serial]
    async fn env_registry_retire_blocks_current_and_hides_old() {
        let _guard = EnvGuard::set(&[
            ("DATA_KEK_CURRENT", "kt2"),
            ("DATA_KEK_kt1", &DataKey::generate().to_base64()),
            ("DATA_KEK_kt2", &DataKey::generate().to_base64()),
        ]);
        let registry = EnvKeyRegistry::from_env().unwrap();

        assert!(registry.retire(&version("kt2")).await.is_err());
        registry.resolve(&version("kt1")).await.unwrap();
        registry.retire(&version("kt1")).await.unwrap();
        assert!(matches!(
            registry.resolve(&version("kt1")).await.unwrap_err(),
            CryptoError::KeyRetired { .. }
        ));
    }
}
