//! Append-only audit trail.
//!
//! The logger validates the shape of caller-supplied events and appends
//! them through an [`AuditStore`], which seals each entry onto its tenant's
//! hash chain. `old_value` and `new_value` are opaque snapshots and are
//! never inspected.
//!
//! Whether a failed append should fail the primary action is policy:
//! [`AuditMode::Synchronous`] propagates the error from
//! [`AuditLogger::record_isolated`], [`AuditMode::BestEffort`] logs it and
//! lets the action proceed. [`AuditLogger::record`] always returns it.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use palisade_core::{AuditEvent, AuditLogEntry, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::{
    error::AuditError,
    storage::AuditStore,
    timeout::{bounded, DEFAULT_STORE_TIMEOUT},
};

/// Maximum length of `action` and `resource`.
pub const MAX_NAME_LEN: usize = 128;

/// Maximum length of `user_agent`.
pub const MAX_USER_AGENT_LEN: usize = 512;

/// Maximum length of `user_id`, `resource_id` and `ip`.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// How audit failures affect the audited action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// Failures are logged; the action proceeds.
    #[default]
    BestEffort,
    /// Failures fail the action.
    Synchronous,
}

impl fmt::Display for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestEffort => write!(f, "best_effort"),
            Self::Synchronous => write!(f, "synchronous"),
        }
    }
}

impl FromStr for AuditMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            "synchronous" | "sync" => Ok(Self::Synchronous),
            other => Err(format!("unknown audit mode: {other}")),
        }
    }
}

/// Validates and appends audit events.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    mode: AuditMode,
    timeout: Duration,
}

impl AuditLogger {
    /// Creates a logger with the default store deadline.
    pub fn new(store: Arc<dyn AuditStore>, mode: AuditMode) -> Self {
        Self { store, mode, timeout: DEFAULT_STORE_TIMEOUT }
    }

    /// Overrides the store deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured failure policy.
    pub fn mode(&self) -> AuditMode {
        self.mode
    }

    /// Validates and appends an event, returning the sealed entry.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Invalid` for malformed events and
    /// `AuditError::Persist` when the store fails or times out.
    #[instrument(skip_all, fields(tenant_id = %event.tenant_id, action = %event.action))]
    pub async fn record(&self, event: AuditEvent) -> Result<AuditLogEntry, AuditError> {
        validate(&event)?;
        let entry = bounded(self.timeout, self.store.append(event)).await?;
        debug!(entry_id = %entry.id, "audit entry appended");
        Ok(entry)
    }

    /// Appends an event under the configured [`AuditMode`].
    ///
    /// In best-effort mode a persistence failure is logged and `Ok(None)`
    /// returned.
    ///
    /// # Errors
    ///
    /// Validation errors in either mode; persistence errors in synchronous
    /// mode.
    pub async fn record_isolated(
        &self,
        event: AuditEvent,
    ) -> Result<Option<AuditLogEntry>, AuditError> {
        match self.record(event).await {
            Ok(entry) => Ok(Some(entry)),
            Err(AuditError::Persist(err)) if self.mode == AuditMode::BestEffort => {
                error!(error = %err, "audit append failed; continuing in best-effort mode");
                Ok(None)
            },
            Err(err) => Err(err),
        }
    }

    /// Returns up to `limit` entries of a tenant in append order.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Persist` when the store fails or times out.
    pub async fn history(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(bounded(self.timeout, self.store.list_for_tenant(tenant_id.clone(), limit)).await?)
    }
}

/// Checks required fields and length bounds.
///
/// # Errors
///
/// Returns `AuditError::Invalid` naming the first offending field.
pub fn validate(event: &AuditEvent) -> Result<(), AuditError> {
    let invalid = |field: &'static str, reason: String| AuditError::Invalid { field, reason };

    if event.tenant_id.as_str().trim().is_empty() {
        return Err(invalid("tenant_id", "is empty".to_string()));
    }

    for (field, value) in [("action", &event.action), ("resource", &event.resource)] {
        if value.trim().is_empty() {
            return Err(invalid(field, "is empty".to_string()));
        }
        check_len(field, value, MAX_NAME_LEN)?;
    }

    if let Some(user_agent) = &event.user_agent {
        check_len("user_agent", user_agent, MAX_USER_AGENT_LEN)?;
    }

    for (field, value) in [
        ("user_id", &event.user_id),
        ("resource_id", &event.resource_id),
        ("ip", &event.ip),
    ] {
        if let Some(value) = value {
            check_len(field, value, MAX_IDENTIFIER_LEN)?;
        }
    }

    Ok(())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), AuditError> {
    let len = value.chars().count();
    if len > max {
        return Err(AuditError::Invalid {
            field,
            reason: format!("is {len} characters, limit is {max}"),
        });
    }
    Ok(())
}
