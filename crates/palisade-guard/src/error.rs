//! Error types for the store-facing guards.

use std::time::Duration;

use palisade_core::{CoreError, PalisadeError};
use thiserror::Error;

/// Result type alias for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Failure talking to the backing store.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The store did not answer before the deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error.
    #[error(transparent)]
    Store(#[from] CoreError),
}

impl GuardError {
    /// Returns whether retrying the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Store(err) => err.is_retryable(),
        }
    }
}

impl From<GuardError> for PalisadeError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Timeout(timeout) => Self::StoreTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            GuardError::Store(err) => err.into(),
        }
    }
}

/// Audit append failure.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The event failed shape validation.
    #[error("invalid audit event: {field} {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The entry could not be persisted.
    #[error("audit append failed: {0}")]
    Persist(#[from] GuardError),
}

impl AuditError {
    /// Returns whether retrying the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Invalid { .. } => false,
            Self::Persist(err) => err.is_retryable(),
        }
    }
}

impl From<AuditError> for PalisadeError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Invalid { .. } => Self::InvalidInput(err.to_string()),
            AuditError::Persist(err) => Self::AuditFailed(err.to_string()),
        }
    }
}
