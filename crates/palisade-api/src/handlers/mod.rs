//! HTTP request handlers.
//!
//! - `webhooks` - authenticated webhook intake with replay protection
//! - `evidence` - integrity-checked evidence download grants
//! - `health` - health, readiness and liveness probes
//!
//! Errors leave every handler as [`crate::error::ApiError`], which renders
//! the stable error code and the matching status.

pub mod evidence;
pub mod health;
pub mod webhooks;

pub use evidence::issue_evidence_grant;
pub use health::{health_check, liveness_check, readiness_check};
pub use webhooks::ingest_webhook;
