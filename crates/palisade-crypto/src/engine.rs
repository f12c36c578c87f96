//! AES-256-GCM column encryption over versioned keys.
//!
//! Every call to [`ColumnEncryptionEngine::encrypt`] draws a fresh 96-bit
//! nonce from the operating system CSPRNG, so concurrent writers never share
//! nonce state. The key version is bound as associated data: relabelling a
//! value with another version makes decryption fail instead of silently
//! trying a different key.
//!
//! Key lookups go through the registry under a deadline; an expired
//! deadline surfaces as [`CryptoError::Timeout`].

use std::{future::Future, sync::Arc, time::Duration};

use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce, Tag,
};
use tracing::{debug, instrument, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    envelope::{EncryptedValue, NONCE_LEN, TAG_LEN},
    error::{CryptoError, Result},
    keys::{DataKey, KeyRegistry, KeyVersion},
};

/// Default deadline for key registry calls.
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_secs(2);

/// Encrypts and decrypts column values with keys from a [`KeyRegistry`].
#[derive(Debug, Clone)]
pub struct ColumnEncryptionEngine {
    registry: Arc<dyn KeyRegistry>,
    key_timeout: Duration,
}

impl ColumnEncryptionEngine {
    /// Creates an engine with the default key lookup deadline.
    pub fn new(registry: Arc<dyn KeyRegistry>) -> Self {
        Self { registry, key_timeout: DEFAULT_KEY_TIMEOUT }
    }

    /// Overrides the key lookup deadline.
    #[must_use]
    pub fn with_key_timeout(mut self, timeout: Duration) -> Self {
        self.key_timeout = timeout;
        self
    }

    /// Returns the registry this engine resolves keys from.
    pub fn registry(&self) -> &Arc<dyn KeyRegistry> {
        &self.registry
    }

    /// Version new writes are encrypted under.
    ///
    /// # Errors
    ///
    /// Returns registry errors or `CryptoError::Timeout`.
    pub async fn current_version(&self) -> Result<KeyVersion> {
        self.bounded(self.registry.current_version()).await
    }

    /// Encrypts `plaintext` under `version`, or the current version when
    /// `None`, and returns the serialized value.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound`/`KeyRetired` if the version does not resolve
    /// and `Timeout` if the registry is too slow.
    #[instrument(skip(self, plaintext), fields(plaintext_len = plaintext.len()))]
    pub async fn encrypt(&self, plaintext: &str, version: Option<&KeyVersion>) -> Result<String> {
        let version = match version {
            Some(version) => version.clone(),
            None => self.current_version().await?,
        };
        let key = self.resolve(&version).await?;

        let value = seal(&key, &version, plaintext.as_bytes())?;
        Ok(value.to_string())
    }

    /// Decrypts a serialized value with the key of its embedded version.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for unparseable input, `KeyNotFound`/`KeyRetired`
    /// when the version does not resolve, and `Tampered` when
    /// authentication fails. Never returns unauthenticated plaintext.
    #[instrument(skip_all)]
    pub async fn decrypt(&self, serialized: &str) -> Result<String> {
        let value = EncryptedValue::parse(serialized)?;
        let key = self.resolve(&value.version).await?;

        let mut plaintext = open(&key, &value)?;
        String::from_utf8(std::mem::take(&mut *plaintext)).map_err(|err| {
            err.into_bytes().zeroize();
            CryptoError::InvalidPlaintext
        })
    }

    /// Reports whether a serialized value is on a non-current version.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the version field is missing.
    pub async fn needs_rotation(&self, serialized: &str) -> Result<bool> {
        let version = EncryptedValue::peek_version(serialized)?;
        Ok(version != self.current_version().await?)
    }

    /// Re-encrypts a value under `target` if it is not already on it.
    ///
    /// Returns `None` for values already on `target`, which makes repeated
    /// sweeps no-ops.
    ///
    /// # Errors
    ///
    /// Same as [`decrypt`](Self::decrypt) and [`encrypt`](Self::encrypt).
    pub async fn rotate_value(
        &self,
        serialized: &str,
        target: &KeyVersion,
    ) -> Result<Option<String>> {
        let value = EncryptedValue::parse(serialized)?;
        if &value.version == target {
            return Ok(None);
        }

        let old_key = self.resolve(&value.version).await?;
        let plaintext = open(&old_key, &value)?;
        let new_key = self.resolve(target).await?;
        let rotated = seal(&new_key, target, &plaintext)?;

        debug!(from = %value.version, to = %target, "re-encrypted value");
        Ok(Some(rotated.to_string()))
    }

    async fn resolve(&self, version: &KeyVersion) -> Result<Arc<DataKey>> {
        self.bounded(self.registry.resolve(version)).await.inspect_err(|err| {
            if matches!(err, CryptoError::KeyNotFound { .. }) {
                warn!(version = %version, "key version not provisioned");
            }
        })
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.key_timeout, operation)
            .await
            .map_err(|_| CryptoError::Timeout(self.key_timeout))?
    }
}

fn cipher_for(key: &DataKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn seal(key: &DataKey, version: &KeyVersion, plaintext: &[u8]) -> Result<EncryptedValue> {
    let cipher = cipher_for(key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, version.as_str().as_bytes(), &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut iv = [0u8; NONCE_LEN];
    iv.copy_from_slice(&nonce);
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);

    Ok(EncryptedValue { version: version.clone(), iv, ciphertext: buffer, tag: tag_bytes })
}

fn open(key: &DataKey, value: &EncryptedValue) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = cipher_for(key);
    let mut buffer = Zeroizing::new(value.ciphertext.clone());

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&value.iv),
            value.version.as_str().as_bytes(),
            &mut buffer,
            Tag::from_slice(&value.tag),
        )
        .map_err(|_| CryptoError::Tampered)?;

    Ok(buffer)
}
