//! Request middleware: webhook authentication and per-tenant rate limiting.
//!
//! Both layers derive the caller's identity through [`RequestContext`],
//! which handlers can also extract directly.

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderName},
};
use palisade_core::{RateLimitKey, TenantId};
use palisade_guard::audit::{MAX_IDENTIFIER_LEN, MAX_USER_AGENT_LEN};

use crate::state::AppState;

pub mod rate_limit;
pub mod webhook;

pub use rate_limit::enforce_rate_limit;
pub use webhook::verify_webhook_signature;

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Caller identity derived from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Tenant named by the tenant header, or the public tenant.
    pub tenant_id: TenantId,
    /// Key the request is throttled under.
    pub rate_limit_key: RateLimitKey,
    /// First `X-Forwarded-For` hop, if any.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Builds the context from headers.
    ///
    /// Client-supplied strings are truncated to the audit field limits so a
    /// long header can never fail an audit append.
    pub fn from_headers(headers: &HeaderMap, tenant_header: &HeaderName) -> Self {
        let tenant = header_str(headers, tenant_header.as_str());
        let credential = extract_credential(headers);

        let ip = header_str(headers, "x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| truncate(value, MAX_IDENTIFIER_LEN));
        let user_agent = header_str(headers, header::USER_AGENT.as_str())
            .map(|value| truncate(value, MAX_USER_AGENT_LEN));

        Self {
            tenant_id: tenant.and_then(TenantId::new).unwrap_or_else(TenantId::public),
            rate_limit_key: RateLimitKey::from_parts(tenant, credential),
            ip,
            user_agent,
        }
    }
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(context) = parts.extensions.get::<Self>() {
            return Ok(context.clone());
        }
        Ok(Self::from_headers(&parts.headers, &state.settings.tenant_header))
    }
}

/// Returns the caller's credential from `x-api-key` or a bearer token.
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, API_KEY_HEADER)
        .or_else(|| {
            header_str(headers, header::AUTHORIZATION.as_str())
                .and_then(|value| value.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
