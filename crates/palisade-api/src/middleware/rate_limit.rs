//! Per-tenant rate limiting middleware.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use palisade_core::PalisadeError;
use palisade_guard::RateDecision;

use super::RequestContext;
use crate::{error::ApiError, state::AppState};

/// Ceiling of the current window.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");

/// Requests left in the current window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Counts the request against its tenant and credential and rejects it
/// with 429 once the window ceiling is exceeded.
///
/// The derived [`RequestContext`] is stored in the request extensions for
/// the handler.
///
/// # Errors
///
/// A store failure in fail-closed mode is returned as a retryable 503.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = RequestContext::from_headers(req.headers(), &state.settings.tenant_header);
    let decision = state
        .rate_limiter
        .check(&context.rate_limit_key, state.settings.rate_limit_per_minute)
        .await?;

    let mut response = match decision {
        RateDecision::Allowed { .. } => {
            req.extensions_mut().insert(context);
            next.run(req).await
        },
        RateDecision::Limited { .. } => {
            let retry_after_secs = decision.retry_after_secs().unwrap_or(1);
            ApiError(PalisadeError::RateLimited { retry_after_secs }).into_response()
        },
    };

    let remaining = match decision {
        RateDecision::Allowed { remaining, .. } => remaining,
        RateDecision::Limited { .. } => 0,
    };
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit()));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));

    Ok(response)
}
