//! Error types and result handling for security middleware operations.
//!
//! Defines the storage-level `CoreError` and the service-wide
//! `PalisadeError` taxonomy with stable codes for client disambiguation and
//! HTTP status mapping. Authentication, throttling, key management,
//! ciphertext integrity and store availability failures each have their own
//! variant so callers must handle them explicitly.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Backing store could not be reached (pool exhausted, IO failure).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Store call exceeded its deadline.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns whether retrying the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Unavailable("connection pool exhausted or closed".to_string())
            },
            sqlx::Error::Io(io_err) => Self::Unavailable(io_err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Palisade error types with stable codes.
#[derive(Debug, Error)]
pub enum PalisadeError {
    // Request errors (E1001-E1005)
    /// Webhook signature missing, malformed, expired or mismatched (E1001).
    #[error("[E1001] Invalid signature: request authentication failed")]
    InvalidSignature,

    /// Request body exceeds the configured limit (E1002).
    #[error("[E1002] Payload too large: size {size_bytes} bytes exceeds {limit_bytes} byte limit")]
    PayloadTooLarge {
        /// Size of the payload in bytes.
        size_bytes: usize,
        /// Configured limit in bytes.
        limit_bytes: usize,
    },

    /// Per-key request ceiling reached for the current window (E1003).
    #[error("[E1003] Rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the next window opens.
        retry_after_secs: u64,
    },

    /// Request failed shape validation (E1004).
    #[error("[E1004] Invalid input: {0}")]
    InvalidInput(String),

    /// Requested resource does not exist for this tenant (E1005).
    #[error("[E1005] Not found: {0}")]
    NotFound(String),

    // Key management and ciphertext errors (E2001-E2004)
    /// No key material is provisioned for the version (E2001).
    #[error("[E2001] Key not found: no key provisioned for version {version}")]
    KeyNotFound {
        /// Version identifier that failed to resolve.
        version: String,
    },

    /// Key version has been retired after rotation (E2002).
    #[error("[E2002] Key retired: version {version} is no longer resolvable")]
    KeyRetired {
        /// Retired version identifier.
        version: String,
    },

    /// Authentication tag did not verify on decrypt (E2003).
    #[error("[E2003] Ciphertext tampered: authentication tag mismatch")]
    CiphertextTampered,

    /// Serialized encrypted value could not be parsed (E2004).
    #[error("[E2004] Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    // Integrity errors (E3001)
    /// Stored evidence hash does not match the fetched bytes (E3001).
    #[error("[E3001] Integrity mismatch: artifact {artifact_id} failed hash verification")]
    IntegrityMismatch {
        /// Artifact whose bytes did not match.
        artifact_id: String,
    },

    // Infrastructure errors (E4001-E4003)
    /// Backing store unreachable (E4001).
    #[error("[E4001] Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Backing store call exceeded its deadline (E4002).
    #[error("[E4002] Store timeout: exceeded {timeout_ms}ms")]
    StoreTimeout {
        /// Timeout that was exceeded in milliseconds.
        timeout_ms: u64,
    },

    /// Audit append failed while synchronous auditing is required (E4003).
    #[error("[E4003] Audit failed: {0}")]
    AuditFailed(String),

    /// Generic error for wrapping other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PalisadeError {
    /// Returns the error code (E1001-E4003).
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "E1001",
            Self::PayloadTooLarge { .. } => "E1002",
            Self::RateLimited { .. } => "E1003",
            Self::InvalidInput(_) => "E1004",
            Self::NotFound(_) => "E1005",
            Self::KeyNotFound { .. } => "E2001",
            Self::KeyRetired { .. } => "E2002",
            Self::CiphertextTampered => "E2003",
            Self::MalformedCiphertext(_) => "E2004",
            Self::IntegrityMismatch { .. } => "E3001",
            Self::StoreUnavailable(_) => "E4001",
            Self::StoreTimeout { .. } => "E4002",
            Self::AuditFailed(_) => "E4003",
            Self::Other(_) => "E9999",
        }
    }

    /// Returns whether the caller may retry the same request.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::StoreUnavailable(_)
                | Self::StoreTimeout { .. }
                | Self::AuditFailed(_)
        )
    }

    /// Returns whether the failure points at missing or broken provisioning
    /// that an operator has to fix.
    pub const fn is_configuration_fault(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::KeyRetired { .. })
    }

    /// Wraps an arbitrary message as an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(message.into()))
    }
}

impl From<CoreError> for PalisadeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(timeout) => Self::StoreTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            CoreError::Unavailable(msg) | CoreError::Database(msg) => Self::StoreUnavailable(msg),
            CoreError::NotFound(msg) => Self::NotFound(msg),
            CoreError::ConstraintViolation(msg) | CoreError::InvalidInput(msg) => {
                Self::InvalidInput(msg)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PalisadeError::InvalidSignature.code(), "E1001");
        assert_eq!(PalisadeError::RateLimited { retry_after_secs: 1 }.code(), "E1003");
        assert_eq!(PalisadeError::KeyNotFound { version: "v1".into() }.code(), "E2001");
        assert_eq!(PalisadeError::CiphertextTampered.code(), "E2003");
        assert_eq!(
            PalisadeError::IntegrityMismatch { artifact_id: "a".into() }.code(),
            "E3001"
        );
        assert_eq!(PalisadeError::StoreTimeout { timeout_ms: 10 }.code(), "E4002");
    }

    #[test]
    fn retryable_errors_identified() {
        assert!(!PalisadeError::InvalidSignature.is_retryable());
        assert!(!PalisadeError::CiphertextTampered.is_retryable());
        assert!(!PalisadeError::KeyRetired { version: "v0".into() }.is_retryable());
        assert!(PalisadeError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(PalisadeError::StoreTimeout { timeout_ms: 250 }.is_retryable());
        assert!(PalisadeError::StoreUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn key_errors_are_configuration_faults() {
        assert!(PalisadeError::KeyNotFound { version: "v9".into() }.is_configuration_fault());
        assert!(!PalisadeError::CiphertextTampered.is_configuration_fault());
    }

    #[test]
    fn core_timeouts_stay_retryable_after_conversion() {
        let err = PalisadeError::from(CoreError::Timeout(Duration::from_millis(1500)));
        assert!(matches!(err, PalisadeError::StoreTimeout { timeout_ms: 1500 }));
        assert!(err.is_retryable());
    }
}
