//! Evidence download grants.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use palisade_core::{ArtifactId, AuditEvent, AuditResult, PalisadeError};
use palisade_crypto::CryptoError;
use palisade_guard::timeout::bounded;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{error::ApiError, middleware::RequestContext, state::AppState};

/// Time-limited download URL for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantResponse {
    /// Signed URL.
    pub url: String,
    /// When the URL stops working.
    pub expires_at: DateTime<Utc>,
}

/// Issues a grant for an artifact owned by the calling tenant, after
/// checking the stored bytes against the recorded hash.
///
/// Artifacts of other tenants are reported as not found.
///
/// # Errors
///
/// 404 for unknown or foreign artifacts, 409 when the hash no longer
/// matches, 503 when a store is unavailable.
#[instrument(
    name = "issue_evidence_grant",
    skip(state, context),
    fields(tenant_id = %context.tenant_id)
)]
pub async fn issue_evidence_grant(
    State(state): State<AppState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<GrantResponse>, ApiError> {
    let artifact_id = ArtifactId::from(id);
    let lookup = state.artifacts.find_for_tenant(context.tenant_id.clone(), artifact_id);
    let artifact = bounded(state.settings.store_timeout, lookup)
        .await?
        .ok_or_else(|| PalisadeError::NotFound(format!("evidence artifact {id}")))?;

    let event = AuditEvent::new(
        context.tenant_id,
        "evidence.grant_issued",
        "evidence_artifact",
        state.clock.now_utc(),
    )
    .with_resource_id(artifact_id.to_string())
    .with_client(context.ip, context.user_agent);

    match state.evidence.grant(&artifact, state.settings.grant_ttl).await {
        Ok(grant) => {
            let event = event.with_change(None, Some(json!({ "expires_at": grant.expires_at })));
            state.audit.record_isolated(event).await?;

            info!(expires_at = %grant.expires_at, "evidence grant issued");
            Ok(Json(GrantResponse { url: grant.url, expires_at: grant.expires_at }))
        },
        Err(err @ CryptoError::IntegrityMismatch { .. }) => {
            let mut denied = event.with_result(AuditResult::Denied);
            denied.action = "evidence.integrity_mismatch".to_string();
            state.audit.record_isolated(denied).await?;

            Err(err.into())
        },
        Err(err) => Err(err.into()),
    }
}
