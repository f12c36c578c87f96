//! PostgreSQL access layer for security middleware state.
//!
//! Each table the middleware owns has one repository. Rate-limit counters
//! and replay markers rely on atomic upserts; the audit log is append-only
//! and guarded by a trigger installed in [`migrate`].

use std::sync::Arc;

use sqlx::PgPool;

pub mod audit_log;
pub mod evidence_artifacts;
pub mod idempotency_records;
pub mod rate_limit_buckets;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for rate-limit counters.
    pub rate_limit_buckets: Arc<rate_limit_buckets::Repository>,

    /// Repository for webhook replay markers.
    pub idempotency_records: Arc<idempotency_records::Repository>,

    /// Repository for the audit trail.
    pub audit_log: Arc<audit_log::Repository>,

    /// Repository for evidence artifact metadata.
    pub evidence_artifacts: Arc<evidence_artifacts::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            rate_limit_buckets: Arc::new(rate_limit_buckets::Repository::new(pool.clone())),
            idempotency_records: Arc::new(idempotency_records::Repository::new(pool.clone())),
            audit_log: Arc::new(audit_log::Repository::new(pool.clone())),
            evidence_artifacts: Arc::new(evidence_artifacts::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity for readiness probes.
    ///
    /// # Errors
    ///
    /// Returns a `CoreError` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

/// Statements creating the middleware schema. Every statement is idempotent.
const SCHEMA: &[(&str, &str)] = &[
    (
        "rate_limit_buckets",
        r"
        CREATE TABLE IF NOT EXISTS rate_limit_buckets (
            key TEXT NOT NULL,
            window_start TIMESTAMPTZ NOT NULL,
            count BIGINT NOT NULL DEFAULT 1,
            PRIMARY KEY (key, window_start)
        )
        ",
    ),
    (
        "idempotency_records",
        r"
        CREATE TABLE IF NOT EXISTS idempotency_records (
            signature TEXT PRIMARY KEY,
            first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "audit_log",
        r"
        CREATE TABLE IF NOT EXISTS audit_log (
            seq BIGSERIAL PRIMARY KEY,
            id UUID NOT NULL UNIQUE,
            tenant_id TEXT NOT NULL,
            user_id TEXT,
            action TEXT NOT NULL,
            resource TEXT NOT NULL,
            resource_id TEXT,
            ip TEXT,
            user_agent TEXT,
            old_value JSONB,
            new_value JSONB,
            result TEXT NOT NULL CHECK (result IN ('success', 'failure', 'denied')),
            timestamp TIMESTAMPTZ NOT NULL,
            prev_hash TEXT NOT NULL,
            entry_hash TEXT NOT NULL UNIQUE
        )
        ",
    ),
    (
        "audit_log tenant index",
        r"
        CREATE INDEX IF NOT EXISTS idx_audit_log_tenant
        ON audit_log(tenant_id, seq)
        ",
    ),
    (
        "audit_log immutability function",
        r"
        CREATE OR REPLACE FUNCTION audit_log_reject_mutation() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION 'audit_log is append-only';
        END;
        $$ LANGUAGE plpgsql
        ",
    ),
    (
        "audit_log immutability trigger",
        r"
        DO $$
        BEGIN
            IF NOT EXISTS (
                SELECT 1 FROM pg_trigger WHERE tgname = 'audit_log_append_only'
            ) THEN
                CREATE TRIGGER audit_log_append_only
                BEFORE UPDATE OR DELETE ON audit_log
                FOR EACH ROW EXECUTE FUNCTION audit_log_reject_mutation();
            END IF;
        END
        $$
        ",
    ),
    (
        "evidence_artifacts",
        r"
        CREATE TABLE IF NOT EXISTS evidence_artifacts (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL CHECK (sha256 ~ '^[0-9a-f]{64}$'),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
];

/// Creates the middleware tables, indexes and the audit immutability trigger.
///
/// # Errors
///
/// Returns the first failing statement's error.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for (name, statement) in SCHEMA {
        sqlx::query(*statement).execute(pool).await?;
        tracing::debug!(object = *name, "schema object ensured");
    }

    Ok(())
}
