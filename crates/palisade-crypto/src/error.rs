//! Error types for key management, column encryption and evidence grants.

use std::time::Duration;

use palisade_core::{CoreError, PalisadeError};
use thiserror::Error;

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors from the encryption engine, key registry, rotation and evidence
/// integrity paths.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No key material is provisioned for the version.
    #[error("no key material provisioned for version {version}")]
    KeyNotFound {
        /// Version that failed to resolve.
        version: String,
    },

    /// The version was retired and can no longer be resolved.
    #[error("key version {version} has been retired")]
    KeyRetired {
        /// Retired version.
        version: String,
    },

    /// Key material exists but is unusable.
    #[error("invalid key material for version {version}: {reason}")]
    InvalidKeyMaterial {
        /// Version whose material is broken.
        version: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Version identifier is not a valid key version.
    #[error("invalid key version identifier: {0:?}")]
    InvalidKeyVersion(String),

    /// Serialized value does not follow the encrypted value format.
    #[error("malformed encrypted value: {0}")]
    Malformed(String),

    /// Authentication tag did not verify.
    #[error("ciphertext failed authentication")]
    Tampered,

    /// Plaintext recovered from a value was not valid UTF-8.
    #[error("decrypted value is not valid UTF-8")]
    InvalidPlaintext,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Key resolution or store access exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Backing store failure during rotation or artifact lookup.
    #[error(transparent)]
    Store(#[from] CoreError),

    /// Evidence bytes no longer match the recorded hash.
    #[error("artifact {artifact_id} failed integrity verification")]
    IntegrityMismatch {
        /// Artifact that failed.
        artifact_id: String,
    },

    /// Object store could not return the artifact bytes.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// A key version cannot be retired yet.
    #[error("cannot retire key version {version}: {reason}")]
    RetirementBlocked {
        /// Version the operator tried to retire.
        version: String,
        /// Why retirement was refused.
        reason: String,
    },

    /// A signed access grant failed validation.
    #[error("invalid access grant: {0}")]
    InvalidGrant(String),
}

impl CryptoError {
    /// Returns whether retrying the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<CryptoError> for PalisadeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyNotFound { version }
            | CryptoError::InvalidKeyMaterial { version, .. } => Self::KeyNotFound { version },
            CryptoError::InvalidKeyVersion(version) => Self::KeyNotFound { version },
            CryptoError::KeyRetired { version } => Self::KeyRetired { version },
            CryptoError::Malformed(msg) => Self::MalformedCiphertext(msg),
            CryptoError::Tampered | CryptoError::InvalidPlaintext => Self::CiphertextTampered,
            CryptoError::Timeout(timeout) => Self::StoreTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            CryptoError::Store(core) => core.into(),
            CryptoError::IntegrityMismatch { artifact_id } => {
                Self::IntegrityMismatch { artifact_id }
            },
            CryptoError::ObjectStore(msg) => Self::StoreUnavailable(msg),
            CryptoError::InvalidGrant(msg) => Self::InvalidInput(msg),
            err @ (CryptoError::EncryptionFailed | CryptoError::RetirementBlocked { .. }) => {
                Self::internal(err.to_string())
            },
        }
    }
}
