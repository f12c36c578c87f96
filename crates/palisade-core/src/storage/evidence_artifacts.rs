//! Repository for evidence artifact metadata.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres};

use crate::{
    error::Result,
    models::{ArtifactId, EvidenceArtifact, TenantId},
};

/// Repository for evidence artifact operations.
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

    /// Registers an artifact with its upload-time hash.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the id already exists.
    pub async fn create(&self, artifact: &EvidenceArtifact) -> Result<()> {
        self.create_impl(&*self.pool, artifact).await
    }

    async fn create_impl<'e, E>(&self, executor: E, artifact: &EvidenceArtifact) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            INSERT INTO evidence_artifacts (id, tenant_id, path, sha256, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(artifact.id)
        .bind(&artifact.tenant_id)
        .bind(&artifact.path)
        .bind(&artifact.sha256)
        .bind(artifact.created_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds an artifact owned by `tenant_id`.
    ///
    /// Artifacts of other tenants are reported as absent.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_for_tenant(
        &self,
        tenant_id: &TenantId,
        id: ArtifactId,
    ) -> Result<Option<EvidenceArtifact>> {
        let artifact = sqlx::query_as::<_, EvidenceArtifact>(
            r"
            SELECT id, tenant_id, path, sha256, created_at
            FROM evidence_artifacts
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(artifact)
    }
}
