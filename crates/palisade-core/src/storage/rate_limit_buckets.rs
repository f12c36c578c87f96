//! Repository for fixed-window rate-limit counters.
//!
//! Counting is a single upsert keyed on `(key, window_start)`: the first
//! request of a window inserts `count = 1`, every later one increments and
//! reads back the new value in the same statement. There is no separate
//! read step, so concurrent requests can never observe the same count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};

use crate::{error::Result, models::RateLimitBucket};

/// Repository for rate-limit bucket operations.
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

    /// Increments the bucket for `key` in `window_start` and returns the
    /// post-increment count.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn increment(&self, key: &str, window_start: DateTime<Utc>) -> Result<i64> {
        self.increment_impl(&*self.pool, key, window_start).await
    }

    async fn increment_impl<'e, E>(
        &self,
        executor: E,
        key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let (count,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO rate_limit_buckets (key, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (key, window_start)
            DO UPDATE SET count = rate_limit_buckets.count + 1
            RETURNING count
            ",
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(executor)
        .await?;

        Ok(count)
    }

    /// Reads a bucket without modifying it.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<RateLimitBucket>> {
        let bucket = sqlx::query_as::<_, RateLimitBucket>(
            r"
            SELECT key, window_start, count
            FROM rate_limit_buckets
            WHERE key = $1 AND window_start = $2
            ",
        )
        .bind(key)
        .bind(window_start)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(bucket)
    }

    /// Deletes buckets whose window started before `cutoff`.
    ///
    /// Stale windows are never read by the limiter; this only reclaims space.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_buckets WHERE window_start < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = PgPool::connect_lazy("postgresql://test").unwrap();
        let repo = Repository::new(Arc::new(pool));
        assert_eq!(Arc::strong_count(&repo.pool()), 2);
    }
}
