//! Mapping of the service error taxonomy onto HTTP responses.
//!
//! Every error leaves the service as
//! `{"error": {"code": "E....", "message": "..."}}`. Internal and
//! configuration faults are reported with their code and a generic message;
//! their detail only goes to the log.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use palisade_core::PalisadeError;
use serde::Serialize;
use tracing::error;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the taxonomy (E1001-E4003)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// HTTP-facing wrapper around [`PalisadeError`].
#[derive(Debug)]
pub struct ApiError(pub PalisadeError);

impl<E> From<E> for ApiError
where
    E: Into<PalisadeError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Status code for each error kind.
pub fn status_for(err: &PalisadeError) -> StatusCode {
    match err {
        PalisadeError::InvalidSignature => StatusCode::UNAUTHORIZED,
        PalisadeError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PalisadeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        PalisadeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PalisadeError::NotFound(_) => StatusCode::NOT_FOUND,
        PalisadeError::IntegrityMismatch { .. } => StatusCode::CONFLICT,
        PalisadeError::StoreUnavailable(_)
        | PalisadeError::StoreTimeout { .. }
        | PalisadeError::AuditFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        PalisadeError::KeyNotFound { .. }
        | PalisadeError::KeyRetired { .. }
        | PalisadeError::CiphertextTampered
        | PalisadeError::MalformedCiphertext(_)
        | PalisadeError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            if err.is_configuration_fault() {
                error!(code = err.code(), error = %err, "key provisioning fault");
            } else {
                error!(code = err.code(), error = %err, "internal error");
            }
            "Internal error".to_string()
        } else {
            err.to_string()
        };

        let body = ErrorResponse { error: ErrorDetail { code: err.code().to_string(), message } };
        let mut response = (status, Json(body)).into_response();

        if let PalisadeError::RateLimited { retry_after_secs } = err {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }

        response
    }
}
