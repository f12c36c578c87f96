//! Repository for webhook replay markers.
//!
//! Records are inserted with `ON CONFLICT DO NOTHING` on the signature
//! primary key. Whether the row was written is the admission decision, so
//! two concurrent inserts of the same signature admit exactly one caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{error::Result, models::IdempotencyRecord};

/// Repository for idempotency record operations.
///
/// Exposes no update or delete: replay protection is permanent.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts the signature if absent. Returns `true` when this call
    /// created the record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_if_absent(
        &self,
        signature: &str,
        first_seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.insert_if_absent_impl(&*self.pool, signature, first_seen_at).await
    }

    /// Inserts the signature if absent within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_if_absent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        signature: &str,
        first_seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.insert_if_absent_impl(&mut **tx, signature, first_seen_at).await
    }

    async fn insert_if_absent_impl<'e, E>(
        &self,
        executor: E,
        signature: &str,
        first_seen_at: DateTime<Utc>,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r"
            INSERT INTO idempotency_records (signature, first_seen_at)
            VALUES ($1, $2)
            ON CONFLICT (signature) DO NOTHING
            ",
        )
        .bind(signature)
        .bind(first_seen_at)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds the record for a signature.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, signature: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r"
            SELECT signature, first_seen_at
            FROM idempotency_records
            WHERE signature = $1
            ",
        )
        .bind(signature)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }
}
