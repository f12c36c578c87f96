//! Append-only repository for the audit trail.
//!
//! Appends take a per-tenant advisory transaction lock, read the tenant's
//! chain head, seal the event against it and insert. The lock serialises
//! appends for one tenant so two writers cannot fork the chain. The table
//! carries a trigger rejecting `UPDATE` and `DELETE`.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AuditEvent, AuditLogEntry, TenantId, GENESIS_HASH},
};

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AuditLogEntry {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            user_id: row.try_get("user_id")?,
            action: row.try_get("action")?,
            resource: row.try_get("resource")?,
            resource_id: row.try_get("resource_id")?,
            ip: row.try_get("ip")?,
            user_agent: row.try_get("user_agent")?,
            old_value: row.try_get("old_value")?,
            new_value: row.try_get("new_value")?,
            result: row.try_get("result")?,
            timestamp: row.try_get("timestamp")?,
            prev_hash: row.try_get("prev_hash")?,
            entry_hash: row.try_get("entry_hash")?,
        })
    }
}

/// Repository for audit log operations.
///
/// Only `append` and reads are offered.
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

    /// Appends an event to its tenant's chain and returns the sealed entry.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditLogEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = self.append_in_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Appends within a caller-owned transaction so the audit write commits
    /// together with the audited action.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: AuditEvent,
    ) -> Result<AuditLogEntry> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(event.tenant_id.as_str())
            .execute(&mut **tx)
            .await?;

        let head: Option<(String,)> = sqlx::query_as(
            r"
            SELECT entry_hash
            FROM audit_log
            WHERE tenant_id = $1
            ORDER BY seq DESC
            LIMIT 1
            ",
        )
        .bind(&event.tenant_id)
        .fetch_optional(&mut **tx)
        .await?;

        let prev_hash = head.map_or_else(|| GENESIS_HASH.to_string(), |(hash,)| hash);
        let entry = AuditLogEntry::seal(event, Uuid::new_v4(), prev_hash);

        sqlx::query(
            r"
            INSERT INTO audit_log (
                id, tenant_id, user_id, action, resource, resource_id, ip,
                user_agent, old_value, new_value, result, timestamp,
                prev_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(&entry.user_id)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.resource_id)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(entry.result)
        .bind(entry.timestamp)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .execute(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Lists a tenant's entries in append order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r"
            SELECT id, tenant_id, user_id, action, resource, resource_id, ip,
                   user_agent, old_value, new_value, result, timestamp,
                   prev_hash, entry_hash
            FROM audit_log
            WHERE tenant_id = $1
            ORDER BY seq ASC
            LIMIT $2
            ",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }
}
