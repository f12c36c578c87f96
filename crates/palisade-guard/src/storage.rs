//! Store abstractions for the guards.
//!
//! Each guard depends on a narrow trait instead of the concrete
//! `palisade_core::storage::Storage`, so that the decision logic can be
//! tested without a database. [`PostgresGuardStorage`] is the production
//! implementation of all three; [`mock::MockGuardStorage`] is an in-memory
//! double with failure and latency injection.
//!
//! Every mutating operation is a single atomic store primitive. None of the
//! traits offers a read that a caller could combine with a later write.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use palisade_core::{
    error::Result, storage::Storage, AuditEvent, AuditLogEntry, RateLimitKey, TenantId,
};

/// Replay record storage.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Inserts `signature` unless it already exists.
    ///
    /// Returns `true` if this call inserted the record. Under concurrent
    /// calls with the same signature exactly one observes `true`.
    fn insert_if_absent(
        &self,
        signature: String,
        first_seen_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;
}

/// Fixed-window counter storage.
pub trait RateLimitStore: Send + Sync + 'static {
    /// Atomically increments the bucket for `(key, window_start)`, creating
    /// it at 1, and returns the post-increment count.
    fn increment(
        &self,
        key: RateLimitKey,
        window_start: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>>;
}

/// Append-only audit storage.
///
/// Entries can only be appended and listed.
pub trait AuditStore: Send + Sync + 'static {
    /// Seals `event` onto the end of its tenant's chain and persists it.
    fn append(
        &self,
        event: AuditEvent,
    ) -> Pin<Box<dyn Future<Output = Result<AuditLogEntry>> + Send + '_>>;

    /// Returns up to `limit` entries of a tenant in append order.
    fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditLogEntry>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
#[derive(Clone)]
pub struct PostgresGuardStorage {
    storage: Arc<Storage>,
}

impl PostgresGuardStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl IdempotencyStore for PostgresGuardStorage {
    fn insert_if_absent(
        &self,
        signature: String,
        first_seen_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.idempotency_records.insert_if_absent(&signature, first_seen_at).await
        })
    }
}

impl RateLimitStore for PostgresGuardStorage {
    fn increment(
        &self,
        key: RateLimitKey,
        window_start: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.rate_limit_buckets.increment(key.as_str(), window_start).await
        })
    }
}

impl AuditStore for PostgresGuardStorage {
    fn append(
        &self,
        event: AuditEvent,
    ) -> Pin<Box<dyn Future<Output = Result<AuditLogEntry>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.audit_log.append(event).await })
    }

    fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditLogEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            storage.audit_log.list_for_tenant(&tenant_id, limit).await
        })
    }
}

pub mod mock {
    //! In-memory guard storage for tests.
    //!
    //! Operations are atomic under a single lock, mirroring the atomicity
    //! of the PostgreSQL statements. Failures and latency can be injected
    //! to exercise timeouts and fail-open/fail-closed paths.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use palisade_core::{error::Result, models::GENESIS_HASH, CoreError};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{
        AuditEvent, AuditLogEntry, AuditStore, IdempotencyStore, RateLimitKey, RateLimitStore,
        TenantId,
    };

    /// Mock storage implementing every guard store trait.
    #[derive(Clone, Default)]
    pub struct MockGuardStorage {
        records: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
        buckets: Arc<RwLock<HashMap<(String, DateTime<Utc>), i64>>>,
        audit: Arc<RwLock<Vec<AuditLogEntry>>>,
        unavailable: Arc<RwLock<Option<String>>>,
        audit_unavailable: Arc<RwLock<Option<String>>>,
        latency: Arc<RwLock<Option<Duration>>>,
    }

    impl MockGuardStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every operation fail with `CoreError::Unavailable` until
        /// cleared with `None`.
        pub async fn set_unavailable(&self, reason: Option<&str>) {
            *self.unavailable.write().await = reason.map(str::to_string);
        }

        /// Makes only audit appends fail, leaving replay and rate-limit
        /// operations working.
        pub async fn set_audit_unavailable(&self, reason: Option<&str>) {
            *self.audit_unavailable.write().await = reason.map(str::to_string);
        }

        /// Delays every operation by `latency` before it touches state.
        pub async fn set_latency(&self, latency: Option<Duration>) {
            *self.latency.write().await = latency;
        }

        /// Number of stored idempotency records.
        pub async fn record_count(&self) -> usize {
            self.records.read().await.len()
        }

        /// Current count of a bucket, if it exists.
        pub async fn bucket_count(
            &self,
            key: &RateLimitKey,
            window_start: DateTime<Utc>,
        ) -> Option<i64> {
            self.buckets.read().await.get(&(key.as_str().to_string(), window_start)).copied()
        }

        /// All audit entries in append order.
        pub async fn audit_entries(&self) -> Vec<AuditLogEntry> {
            self.audit.read().await.clone()
        }

        /// Replaces a stored audit entry, simulating tampering behind the
        /// store's back.
        pub async fn tamper_audit_entry(&self, index: usize, entry: AuditLogEntry) {
            if let Some(slot) = self.audit.write().await.get_mut(index) {
                *slot = entry;
            }
        }

        async fn gate(&self) -> Result<()> {
            let latency = *self.latency.read().await;
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            match self.unavailable.read().await.as_ref() {
                Some(reason) => Err(CoreError::Unavailable(reason.clone())),
                None => Ok(()),
            }
        }
    }

    impl IdempotencyStore for MockGuardStorage {
        fn insert_if_absent(
            &self,
            signature: String,
            first_seen_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.gate().await?;
                let mut records = self.records.write().await;
                if records.contains_key(&signature) {
                    return Ok(false);
                }
                records.insert(signature, first_seen_at);
                Ok(true)
            })
        }
    }

    impl RateLimitStore for MockGuardStorage {
        fn increment(
            &self,
            key: RateLimitKey,
            window_start: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
            Box::pin(async move {
                self.gate().await?;
                let mut buckets = self.buckets.write().await;
                let count = buckets.entry((key.as_str().to_string(), window_start)).or_insert(0);
                *count += 1;
                Ok(*count)
            })
        }
    }

    impl AuditStore for MockGuardStorage {
        fn append(
            &self,
            event: AuditEvent,
        ) -> Pin<Box<dyn Future<Output = Result<AuditLogEntry>> + Send + '_>> {
            Box::pin(async move {
                self.gate().await?;
                if let Some(reason) = self.audit_unavailable.read().await.as_ref() {
                    return Err(CoreError::Unavailable(reason.clone()));
                }
                let mut audit = self.audit.write().await;
                let prev_hash = audit
                    .iter()
                    .rev()
                    .find(|entry| entry.tenant_id == event.tenant_id)
                    .map_or_else(|| GENESIS_HASH.to_string(), |entry| entry.entry_hash.clone());
                let entry = AuditLogEntry::seal(event, Uuid::new_v4(), prev_hash);
                audit.push(entry.clone());
                Ok(entry)
            })
        }

        fn list_for_tenant(
            &self,
            tenant_id: TenantId,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditLogEntry>>> + Send + '_>> {
            Box::pin(async move {
                self.gate().await?;
                Ok(self
                    .audit
                    .read()
                    .await
                    .iter()
                    .filter(|entry| entry.tenant_id == tenant_id)
                    .take(limit)
                    .cloned()
                    .collect())
            })
        }
    }
}
