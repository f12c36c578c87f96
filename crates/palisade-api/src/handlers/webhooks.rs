//! Webhook intake.
//!
//! Runs behind [`crate::middleware::verify_webhook_signature`], so the
//! handler only ever sees authenticated bodies. Each verified delivery is
//! admitted at most once; replays are acknowledged with `duplicate: true`
//! and not processed again.

use axum::{extract::State, Extension, Json};
use palisade_core::AuditEvent;
use palisade_crypto::VerifiedWebhook;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::{error::ApiError, middleware::RequestContext, state::AppState};

/// Response to an accepted webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Always `accepted`.
    pub status: String,
    /// Whether this delivery was a replay of one already processed.
    pub duplicate: bool,
}

/// Admits a verified webhook and records it in the audit trail.
///
/// # Errors
///
/// Returns a retryable 503 when the replay store is unavailable, or when
/// synchronous auditing is configured and the audit append fails.
#[instrument(
    name = "ingest_webhook",
    skip_all,
    fields(tenant_id = %context.tenant_id, body_bytes = webhook.body().len())
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    context: RequestContext,
    Extension(webhook): Extension<VerifiedWebhook>,
) -> Result<Json<IngestResponse>, ApiError> {
    let admission = state.idempotency.admit_once(&webhook).await?;
    let duplicate = admission.is_duplicate();

    let action = if duplicate { "webhook.replayed" } else { "webhook.received" };
    let event = AuditEvent::new(context.tenant_id, action, "webhook", state.clock.now_utc())
        .with_client(context.ip, context.user_agent)
        .with_change(
            None,
            Some(json!({ "duplicate": duplicate, "body_bytes": webhook.body().len() })),
        );
    state.audit.record_isolated(event).await?;

    info!(duplicate, "webhook accepted");
    Ok(Json(IngestResponse { status: "accepted".to_string(), duplicate }))
}
