//! HMAC-SHA256 webhook signature verification with timestamp skew bounds.
//!
//! The signed payload is `<timestamp>\n<raw body>` and the signature header
//! carries `sha256=<hex>`. Comparison goes through `Mac::verify_slice`,
//! which is constant time. Every failure is reported as a
//! [`SignatureError`] value; nothing in this module panics on input.
//!
//! A successful check yields a [`VerifiedWebhook`], which is the only way to
//! reach the idempotency guard.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use hmac::{Hmac, Mac};
use palisade_core::Clock;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Length of an HMAC-SHA256 output in bytes.
pub const SIGNATURE_LEN: usize = 32;

/// Why a webhook failed authentication.
///
/// Used for logs only. Clients always receive the same generic response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Signature header absent or blank.
    #[error("signature header missing")]
    MissingSignature,

    /// Timestamp header absent or blank.
    #[error("timestamp header missing")]
    MissingTimestamp,

    /// Timestamp header is not an integer number of seconds.
    #[error("timestamp header is not numeric")]
    InvalidTimestamp,

    /// Timestamp is outside the accepted skew window.
    #[error("timestamp outside allowed skew of {max_skew_seconds}s")]
    TimestampOutOfRange {
        /// Accepted skew in seconds.
        max_skew_seconds: u64,
    },

    /// Signature header is not `sha256=<64 hex chars>`.
    #[error("invalid signature format")]
    InvalidFormat,

    /// Signature does not match the payload.
    #[error("signature mismatch")]
    Mismatch,

    /// Shared secret is empty or unusable.
    #[error("invalid shared secret")]
    InvalidSecret,
}

/// Proof that a webhook body passed signature verification.
///
/// Only this module can construct it.
#[derive(Clone)]
pub struct VerifiedWebhook {
    signature: String,
    timestamp: i64,
    body: Bytes,
}

impl VerifiedWebhook {
    /// Signature header value in canonical lowercase form, used as the
    /// replay key.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Signed timestamp in seconds since the UNIX epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Raw body bytes that were authenticated.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the token and returns the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }
}

impl fmt::Debug for VerifiedWebhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedWebhook")
            .field("timestamp", &self.timestamp)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Computes the `sha256=<hex>` signature for a body and timestamp.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is empty.
pub fn sign(body: &[u8], timestamp: &str, secret: &[u8]) -> Result<String, SignatureError> {
    let mac = signed_payload_mac(body, timestamp, secret)?;
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Returns whether the request is authentic at the current system time.
pub fn verify(
    raw_body: &[u8],
    timestamp_header: Option<&str>,
    signature_header: Option<&str>,
    secret: &[u8],
    max_skew_seconds: u64,
) -> bool {
    let now = chrono::Utc::now().timestamp();
    verify_at(raw_body, timestamp_header, signature_header, secret, max_skew_seconds, now)
}

/// Returns whether the request is authentic at `now` (UNIX seconds).
pub fn verify_at(
    raw_body: &[u8],
    timestamp_header: Option<&str>,
    signature_header: Option<&str>,
    secret: &[u8],
    max_skew_seconds: u64,
    now: i64,
) -> bool {
    check(raw_body, timestamp_header, signature_header, secret, max_skew_seconds, now).is_ok()
}

/// Verifies a request and returns the verification token.
///
/// # Errors
///
/// Returns the first check that failed.
pub fn verify_webhook(
    body: Bytes,
    timestamp_header: Option<&str>,
    signature_header: Option<&str>,
    secret: &[u8],
    max_skew_seconds: u64,
    now: i64,
) -> Result<VerifiedWebhook, SignatureError> {
    let timestamp =
        check(&body, timestamp_header, signature_header, secret, max_skew_seconds, now)?;

    Ok(VerifiedWebhook {
        // Uppercase hex verifies too; both spellings share one replay key
        signature: signature_header.unwrap_or_default().trim().to_ascii_lowercase(),
        timestamp,
        body,
    })
}

fn check(
    body: &[u8],
    timestamp_header: Option<&str>,
    signature_header: Option<&str>,
    secret: &[u8],
    max_skew_seconds: u64,
    now: i64,
) -> Result<i64, SignatureError> {
    let signature = signature_header
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingSignature)?;

    let timestamp_text = timestamp_header
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingTimestamp)?;

    if !timestamp_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SignatureError::InvalidTimestamp);
    }
    let timestamp: i64 = timestamp_text.parse().map_err(|_| SignatureError::InvalidTimestamp)?;

    if now.abs_diff(timestamp) > max_skew_seconds {
        return Err(SignatureError::TimestampOutOfRange { max_skew_seconds });
    }

    let provided = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(SignatureError::InvalidFormat)?;

    if provided.len() != SIGNATURE_LEN {
        return Err(SignatureError::InvalidFormat);
    }

    signed_payload_mac(body, timestamp_text, secret)?
        .verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)?;

    Ok(timestamp)
}

fn signed_payload_mac(
    body: &[u8],
    timestamp: &str,
    secret: &[u8],
) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(timestamp.as_bytes());
    mac.update(b"\n");
    mac.update(body);
    Ok(mac)
}

/// Verifier bound to a shared secret, skew window and clock.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Arc<Zeroizing<Vec<u8>>>,
    max_skew_seconds: u64,
    clock: Arc<dyn Clock>,
}

impl SignatureVerifier {
    /// Creates a verifier for the given secret.
    pub fn new(secret: impl Into<Vec<u8>>, max_skew_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self { secret: Arc::new(Zeroizing::new(secret.into())), max_skew_seconds, clock }
    }

    /// Accepted skew in seconds.
    pub fn max_skew_seconds(&self) -> u64 {
        self.max_skew_seconds
    }

    /// Verifies a request at the clock's current time.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub fn verify(
        &self,
        body: Bytes,
        timestamp_header: Option<&str>,
        signature_header: Option<&str>,
    ) -> Result<VerifiedWebhook, SignatureError> {
        verify_webhook(
            body,
            timestamp_header,
            signature_header,
            &self.secret,
            self.max_skew_seconds,
            self.clock.unix_seconds(),
        )
    }

    /// Signs a body with this verifier's secret.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::InvalidSecret` if the secret is empty.
    pub fn sign(&self, body: &[u8], timestamp: &str) -> Result<String, SignatureError> {
        sign(body, timestamp, &self.secret)
    }
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .field("max_skew_seconds", &self.max_skew_seconds)
            .finish_non_exhaustive()
    }
}
