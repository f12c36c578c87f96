//! Webhook signature verification middleware.
//!
//! Buffers the body up to the configured limit, verifies the HMAC over
//! `<timestamp>\n<body>` and hands the handler a [`VerifiedWebhook`] in the
//! request extensions. Requests that fail are answered with a generic 401;
//! the reason is logged, the payload never is.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use http_body_util::LengthLimitError;
use palisade_core::PalisadeError;
use palisade_crypto::VerifiedWebhook;
use tracing::{debug, warn};

use crate::{error::ApiError, state::AppState};

/// Axum middleware guarding webhook routes.
///
/// # Errors
///
/// `PayloadTooLarge` when the body exceeds the limit, `InvalidInput` when
/// the body cannot be read and `InvalidSignature` for any authentication
/// failure.
pub async fn verify_webhook_signature(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();
    let limit = state.settings.max_body_bytes;

    let declared = declared_length(&parts.headers);
    if let Some(size) = declared.filter(|size| *size > limit) {
        debug!(size, limit, "webhook body exceeds limit");
        return Err(PalisadeError::PayloadTooLarge { size_bytes: size, limit_bytes: limit }.into());
    }

    let bytes = axum::body::to_bytes(body, limit).await.map_err(|err| {
        if exceeds_limit(&err) {
            PalisadeError::PayloadTooLarge {
                size_bytes: declared.unwrap_or_else(|| limit.saturating_add(1)),
                limit_bytes: limit,
            }
        } else {
            debug!(error = %err, "failed to read webhook body");
            PalisadeError::InvalidInput("failed to read request body".to_string())
        }
    })?;

    let timestamp = header_value(&parts.headers, state.settings.timestamp_header.as_str());
    let signature = header_value(&parts.headers, state.settings.signature_header.as_str());

    let webhook: VerifiedWebhook = state
        .verifier
        .verify(bytes, timestamp, signature)
        .map_err(|reason| {
            warn!(%reason, "webhook authentication failed");
            PalisadeError::InvalidSignature
        })?;

    let body = Body::from(webhook.body().clone());
    parts.extensions.insert(webhook);

    Ok(next.run(Request::from_parts(parts, body)).await)
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
