//! Background re-encryption of column values and key retirement.
//!
//! A sweep walks every row whose value is on an old key version, in keyset
//! order, and re-encrypts it under the current version. Each row is written
//! back with a compare-and-swap on the old serialized value, so a row that
//! changed underneath the sweep is left alone and picked up on the next
//! pass. Values already on the current version are skipped, which makes
//! sweeps safe to repeat.
//!
//! ```text
//! fetch_batch(v_old, after) ──▶ decrypt(v_old) ──▶ encrypt(v_current) ──▶ CAS
//!        ▲                                                                 │
//!        └───────────────────── next batch (id > last) ◀───────────────────┘
//! ```
//!
//! Retiring the old version is a separate, operator-driven step guarded by
//! [`KeyRetirement`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use palisade_core::{Clock, CoreError};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    engine::ColumnEncryptionEngine,
    envelope::EncryptedValue,
    error::{CryptoError, Result},
    keys::{KeyRegistry, KeyVersion},
};

/// Default number of rows fetched per batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of rows re-encrypted concurrently.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Table and columns holding one encrypted field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTarget {
    /// Table name.
    pub table: String,
    /// Primary key column, compared as text.
    pub id_column: String,
    /// Column holding serialized encrypted values.
    pub value_column: String,
}

impl ColumnTarget {
    /// Creates a target, validating every identifier.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` unless each name matches
    /// `[A-Za-z_][A-Za-z0-9_]{0,62}`.
    pub fn new(
        table: impl Into<String>,
        id_column: impl Into<String>,
        value_column: impl Into<String>,
    ) -> std::result::Result<Self, CoreError> {
        let target = Self {
            table: table.into(),
            id_column: id_column.into(),
            value_column: value_column.into(),
        };
        for name in [&target.table, &target.id_column, &target.value_column] {
            if !is_identifier(name) {
                return Err(CoreError::InvalidInput(format!("invalid SQL identifier: {name:?}")));
            }
        }
        Ok(target)
    }

    /// Parses `table.id_column.value_column`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for anything but three valid
    /// dot-separated identifiers.
    pub fn parse(raw: &str) -> std::result::Result<Self, CoreError> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        match parts.as_slice() {
            [table, id, value] => Self::new(*table, *id, *value),
            _ => Err(CoreError::InvalidInput(format!(
                "column target must be table.id_column.value_column, got {raw:?}"
            ))),
        }
    }
}

impl fmt::Display for ColumnTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.table, self.id_column, self.value_column)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// A row of an encrypted column.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EncryptedRow {
    /// Primary key rendered as text.
    pub row_id: String,
    /// Serialized encrypted value.
    pub value: String,
}

/// Storage of one encrypted column, as seen by the rotation sweep.
#[async_trait]
pub trait EncryptedColumnStore: Send + Sync {
    /// Column this store reads and writes.
    fn target(&self) -> &ColumnTarget;

    /// Returns up to `limit` rows on `version` with id greater than `after`,
    /// ordered by id.
    async fn fetch_batch(
        &self,
        version: &KeyVersion,
        after: Option<&str>,
        limit: usize,
    ) -> std::result::Result<Vec<EncryptedRow>, CoreError>;

    /// Replaces the value of `row_id` only if it still equals `expected`.
    /// Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        row_id: &str,
        expected: &str,
        replacement: &str,
    ) -> std::result::Result<bool, CoreError>;

    /// Counts rows still on `version`.
    async fn count_with_version(&self, version: &KeyVersion)
        -> std::result::Result<u64, CoreError>;
}

/// PostgreSQL implementation over a configured [`ColumnTarget`].
pub struct PgEncryptedColumnStore {
    pool: Arc<PgPool>,
    target: ColumnTarget,
    fetch_sql: String,
    cas_sql: String,
    count_sql: String,
}

impl PgEncryptedColumnStore {
    /// Creates a store for `target`. Identifiers were validated by
    /// [`ColumnTarget::new`] and are additionally quoted.
    pub fn new(pool: Arc<PgPool>, target: ColumnTarget) -> Self {
        let table = quote(&target.table);
        let id = quote(&target.id_column);
        let value = quote(&target.value_column);

        let fetch_sql = format!(
            "SELECT {id}::text AS row_id, {value} AS value FROM {table} \
             WHERE left({value}, length($1)) = $1 \
             AND ($2::text IS NULL OR {id}::text > $2) \
             ORDER BY {id}::text LIMIT $3"
        );
        let cas_sql =
            format!("UPDATE {table} SET {value} = $3 WHERE {id}::text = $1 AND {value} = $2");
        let count_sql =
            format!("SELECT COUNT(*) FROM {table} WHERE left({value}, length($1)) = $1");

        Self { pool, target, fetch_sql, cas_sql, count_sql }
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

#[async_trait]
impl EncryptedColumnStore for PgEncryptedColumnStore {
    fn target(&self) -> &ColumnTarget {
        &self.target
    }

    async fn fetch_batch(
        &self,
        version: &KeyVersion,
        after: Option<&str>,
        limit: usize,
    ) -> std::result::Result<Vec<EncryptedRow>, CoreError> {
        let rows = sqlx::query_as::<_, EncryptedRow>(&self.fetch_sql)
            .bind(EncryptedValue::version_prefix(version))
            .bind(after)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows)
    }

    async fn compare_and_swap(
        &self,
        row_id: &str,
        expected: &str,
        replacement: &str,
    ) -> std::result::Result<bool, CoreError> {
        let result = sqlx::query(&self.cas_sql)
            .bind(row_id)
            .bind(expected)
            .bind(replacement)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_with_version(
        &self,
        version: &KeyVersion,
    ) -> std::result::Result<u64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(&self.count_sql)
            .bind(EncryptedValue::version_prefix(version))
            .fetch_one(&*self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Tally of one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows fetched.
    pub scanned: u64,
    /// Rows re-encrypted and written back.
    pub rotated: u64,
    /// Rows that were already off the swept version.
    pub skipped: u64,
    /// Rows changed concurrently; left for the next pass.
    pub conflicts: u64,
    /// Rows that could not be decrypted or written.
    pub failed: u64,
    /// Whether the sweep stopped on cancellation.
    pub cancelled: bool,
}

impl SweepReport {
    /// True when the run covered every row and left nothing behind.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.conflicts == 0 && self.failed == 0
    }

    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Rotated => self.rotated += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Conflict => self.conflicts += 1,
            RowOutcome::Failed => self.failed += 1,
            RowOutcome::Cancelled => self.cancelled = true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Rotated,
    Skipped,
    Conflict,
    Failed,
    Cancelled,
}

/// Re-encrypts one encrypted column from an old version to the current one.
pub struct RotationSweep {
    engine: ColumnEncryptionEngine,
    store: Arc<dyn EncryptedColumnStore>,
    batch_size: usize,
    concurrency: usize,
}

impl RotationSweep {
    /// Creates a sweep with default batch size and concurrency.
    pub fn new(engine: ColumnEncryptionEngine, store: Arc<dyn EncryptedColumnStore>) -> Self {
        Self { engine, store, batch_size: DEFAULT_BATCH_SIZE, concurrency: DEFAULT_CONCURRENCY }
    }

    /// Sets rows per batch (at least one).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets concurrent rows per batch (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Engine the sweep re-encrypts with.
    pub fn engine(&self) -> &ColumnEncryptionEngine {
        &self.engine
    }

    /// Moves every value on `from_version` to the current version.
    ///
    /// Cancellation is checked before each row; rows already written stay
    /// written.
    ///
    /// # Errors
    ///
    /// Returns registry errors for the current version and store errors
    /// from batch fetches. Per-row failures are counted, not returned.
    #[instrument(skip(self, cancel), fields(target = %self.store.target()))]
    pub async fn run(
        &self,
        from_version: &KeyVersion,
        cancel: CancellationToken,
    ) -> Result<SweepReport> {
        let target_version = self.engine.current_version().await?;
        let mut report = SweepReport::default();

        if from_version == &target_version {
            debug!(version = %from_version, "version is current, nothing to sweep");
            return Ok(report);
        }

        let mut after: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let rows =
                self.store.fetch_batch(from_version, after.as_deref(), self.batch_size).await?;
            let fetched = rows.len();
            if fetched == 0 {
                break;
            }
            report.scanned += fetched as u64;
            after = rows.last().map(|row| row.row_id.clone());

            let outcomes: Vec<RowOutcome> = stream::iter(rows)
                .map(|row| self.rotate_row(row, from_version, &target_version, &cancel))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                report.record(outcome);
            }

            if report.cancelled || fetched < self.batch_size {
                break;
            }
        }

        info!(
            from = %from_version,
            to = %target_version,
            scanned = report.scanned,
            rotated = report.rotated,
            skipped = report.skipped,
            conflicts = report.conflicts,
            failed = report.failed,
            cancelled = report.cancelled,
            "rotation sweep finished"
        );
        Ok(report)
    }

    async fn rotate_row(
        &self,
        row: EncryptedRow,
        from_version: &KeyVersion,
        target_version: &KeyVersion,
        cancel: &CancellationToken,
    ) -> RowOutcome {
        if cancel.is_cancelled() {
            return RowOutcome::Cancelled;
        }

        match EncryptedValue::peek_version(&row.value) {
            Ok(version) if &version != from_version => return RowOutcome::Skipped,
            Ok(_) => {},
            Err(err) => {
                warn!(row_id = %row.row_id, error = %err, "unparseable encrypted value");
                return RowOutcome::Failed;
            },
        }

        let rotated = match self.engine.rotate_value(&row.value, target_version).await {
            Ok(Some(rotated)) => rotated,
            Ok(None) => return RowOutcome::Skipped,
            Err(err) => {
                warn!(row_id = %row.row_id, error = %err, "failed to re-encrypt value");
                return RowOutcome::Failed;
            },
        };

        match self.store.compare_and_swap(&row.row_id, &row.value, &rotated).await {
            Ok(true) => RowOutcome::Rotated,
            Ok(false) => {
                debug!(row_id = %row.row_id, "row changed during sweep");
                RowOutcome::Conflict
            },
            Err(err) => {
                warn!(row_id = %row.row_id, error = %err, "failed to write re-encrypted value");
                RowOutcome::Failed
            },
        }
    }
}

/// Guards retirement of a key version.
///
/// A version may be retired only when it is not current, no value in any
/// configured column still uses it, and the grace window since the current
/// version's promotion has elapsed.
pub struct KeyRetirement {
    registry: Arc<dyn KeyRegistry>,
    stores: Vec<Arc<dyn EncryptedColumnStore>>,
    grace_period: Duration,
    clock: Arc<dyn Clock>,
}

impl KeyRetirement {
    /// Creates a retirement guard over the given columns.
    pub fn new(
        registry: Arc<dyn KeyRegistry>,
        stores: Vec<Arc<dyn EncryptedColumnStore>>,
        grace_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, stores, grace_period, clock }
    }

    /// Retires `version` if every precondition holds.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RetirementBlocked` naming the unmet
    /// precondition, or store/registry errors.
    #[instrument(skip(self))]
    pub async fn retire(&self, version: &KeyVersion) -> Result<()> {
        let blocked = |reason: String| CryptoError::RetirementBlocked {
            version: version.to_string(),
            reason,
        };

        if &self.registry.current_version().await? == version {
            return Err(blocked("version is current".to_string()));
        }

        let promoted_at = self
            .registry
            .promoted_at()
            .await?
            .ok_or_else(|| blocked("promotion time of the current version is unknown".into()))?;
        let grace = chrono::Duration::from_std(self.grace_period)
            .map_err(|_| blocked("grace period out of range".to_string()))?;
        let grace_ends = promoted_at + grace;
        if self.clock.now_utc() < grace_ends {
            return Err(blocked(format!("grace window ends at {}", grace_ends.to_rfc3339())));
        }

        for store in &self.stores {
            let remaining = store.count_with_version(version).await?;
            if remaining > 0 {
                return Err(blocked(format!(
                    "{remaining} values in {} still use this version",
                    store.target()
                )));
            }
        }

        self.registry.retire(version).await?;
        info!(version = %version, "key version retired");
        Ok(())
    }
}

pub mod mock {
    //! In-memory encrypted column for sweep and retirement tests.

    use std::collections::BTreeMap;

    use tokio::sync::RwLock;

    use super::{
        async_trait, ColumnTarget, CoreError, EncryptedColumnStore, EncryptedRow, EncryptedValue,
        KeyVersion,
    };

    /// In-memory column keyed by row id in text order.
    pub struct MemoryColumnStore {
        target: ColumnTarget,
        rows: RwLock<BTreeMap<String, String>>,
        concurrent_writes: RwLock<BTreeMap<String, String>>,
        fail_writes: RwLock<bool>,
    }

    impl MemoryColumnStore {
        /// Creates an empty column.
        pub fn new(target: ColumnTarget) -> Self {
            Self {
                target,
                rows: RwLock::new(BTreeMap::new()),
                concurrent_writes: RwLock::new(BTreeMap::new()),
                fail_writes: RwLock::new(false),
            }
        }

        /// Inserts or replaces a row.
        pub async fn insert(&self, row_id: impl Into<String>, value: impl Into<String>) {
            self.rows.write().await.insert(row_id.into(), value.into());
        }

        /// Returns the current value of a row.
        pub async fn get(&self, row_id: &str) -> Option<String> {
            self.rows.read().await.get(row_id).cloned()
        }

        /// Returns every row.
        pub async fn snapshot(&self) -> BTreeMap<String, String> {
            self.rows.read().await.clone()
        }

        /// Overwrites `row_id` just before its next compare-and-swap,
        /// simulating a concurrent application write.
        pub async fn inject_concurrent_write(
            &self,
            row_id: impl Into<String>,
            value: impl Into<String>,
        ) {
            self.concurrent_writes.write().await.insert(row_id.into(), value.into());
        }

        /// Makes every compare-and-swap fail with a store error.
        pub async fn fail_writes(&self, fail: bool) {
            *self.fail_writes.write().await = fail;
        }
    }

    #[async_trait]
    impl EncryptedColumnStore for MemoryColumnStore {
        fn target(&self) -> &ColumnTarget {
            &self.target
        }

        async fn fetch_batch(
            &self,
            version: &KeyVersion,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<EncryptedRow>, CoreError> {
            let prefix = EncryptedValue::version_prefix(version);
            Ok(self
                .rows
                .read()
                .await
                .iter()
                .filter(|(id, _)| after.map_or(true, |after| id.as_str() > after))
                .filter(|(_, value)| value.starts_with(&prefix))
                .take(limit)
                .map(|(id, value)| EncryptedRow { row_id: id.clone(), value: value.clone() })
                .collect())
        }

        async fn compare_and_swap(
            &self,
            row_id: &str,
            expected: &str,
            replacement: &str,
        ) -> Result<bool, CoreError> {
            if *self.fail_writes.read().await {
                return Err(CoreError::Unavailable("injected write failure".to_string()));
            }

            let mut rows = self.rows.write().await;
            if let Some(value) = self.concurrent_writes.write().await.remove(row_id) {
                rows.insert(row_id.to_string(), value);
            }

            match rows.get_mut(row_id) {
                Some(current) if current == expected => {
                    *current = replacement.to_string();
                    Ok(true)
                },
                _ => Ok(false),
            }
        }

        async fn count_with_version(&self, version: &KeyVersion) -> Result<u64, CoreError> {
            let prefix = EncryptedValue::version_prefix(version);
            Ok(self.rows.read().await.values().filter(|v| v.starts_with(&prefix)).count() as u64)
        }
    }
}
