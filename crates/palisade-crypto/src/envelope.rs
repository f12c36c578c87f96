//! Self-describing serialization of encrypted column values.
//!
//! Format: `v=<version>;iv=<b64url>;ct=<b64url>;tag=<b64url>` with URL-safe
//! base64 without padding. Fields appear in that fixed order. Fields after
//! `tag` are ignored so newer writers can append metadata without breaking
//! older readers; the meaning of the four leading fields never changes.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::{
    error::{CryptoError, Result},
    keys::KeyVersion,
};

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits).
pub const TAG_LEN: usize = 16;

const FIELD_ORDER: [&str; 4] = ["v", "iv", "ct", "tag"];

/// Parsed encrypted column value.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    /// Key version that produced the value.
    pub version: KeyVersion,
    /// Per-encryption random nonce.
    pub iv: [u8; NONCE_LEN],
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Authentication tag.
    pub tag: [u8; TAG_LEN],
}

impl EncryptedValue {
    /// Parses the serialized form.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Malformed` for missing or out-of-order fields,
    /// invalid base64url, or wrong nonce/tag lengths, and
    /// `CryptoError::InvalidKeyVersion` for an unusable version.
    pub fn parse(serialized: &str) -> Result<Self> {
        let mut fields = serialized.split(';');
        let mut values: [&str; 4] = [""; 4];

        for (slot, expected) in values.iter_mut().zip(FIELD_ORDER) {
            let field = fields
                .next()
                .ok_or_else(|| CryptoError::Malformed(format!("missing field {expected}")))?;
            let (name, value) = field
                .split_once('=')
                .ok_or_else(|| CryptoError::Malformed(format!("field {expected} has no value")))?;
            if name != expected {
                return Err(CryptoError::Malformed(format!(
                    "expected field {expected}, found {name}"
                )));
            }
            *slot = value;
        }

        let [version, iv, ct, tag] = values;
        let version = KeyVersion::new(version)?;
        let iv = decode_fixed::<NONCE_LEN>("iv", iv)?;
        let ciphertext = decode("ct", ct)?;
        let tag = decode_fixed::<TAG_LEN>("tag", tag)?;

        Ok(Self { version, iv, ciphertext, tag })
    }

    /// Returns only the version of a serialized value.
    ///
    /// Cheaper than [`EncryptedValue::parse`]; used to skip rows that are
    /// already on the wanted version.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Malformed` if the value does not start with a
    /// version field.
    pub fn peek_version(serialized: &str) -> Result<KeyVersion> {
        let first = serialized.split(';').next().unwrap_or_default();
        let version = first
            .strip_prefix("v=")
            .ok_or_else(|| CryptoError::Malformed("missing field v".to_string()))?;
        KeyVersion::new(version)
    }

    /// Prefix every value of `version` starts with.
    pub fn version_prefix(version: &KeyVersion) -> String {
        format!("v={version};")
    }
}

impl fmt::Display for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v={};iv={};ct={};tag={}",
            self.version,
            URL_SAFE_NO_PAD.encode(self.iv),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
            URL_SAFE_NO_PAD.encode(self.tag),
        )
    }
}

impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("version", &self.version)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| CryptoError::Malformed(format!("field {field} is not base64url: {e}")))
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    let bytes = decode(field, value)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        CryptoError::Malformed(format!("field {field} must be {N} bytes, got {}", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedValue {
        EncryptedValue {
            version: KeyVersion::new("v2").unwrap(),
            iv: [7u8; NONCE_LEN],
            ciphertext: b"opaque".to_vec(),
            tag: [9u8; TAG_LEN],
        }
    }

    #[test]
    fn serialized_form_has_fixed_field_order() {
        let text = sample().to_string();
        assert!(text.starts_with("v=v2;iv="));
        let names: Vec<&str> =
            text.split(';').map(|f| f.split_once('=').unwrap().0).collect();
        assert_eq!(names, vec!["v", "iv", "ct", "tag"]);
        assert!(!text.contains('+') && !text.contains('/') && !text.contains("=="));
    }

    #[test]
    fn parse_is_exact_inverse_of_display() {
        let value = sample();
        let text = value.to_string();
        let parsed = EncryptedValue::parse(&text).unwrap();
        assert_eq!(parsed, value);
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn trailing_fields_are_ignored() {
        let text = format!("{};kid=abc;alg=A256GCM", sample());
        assert_eq!(EncryptedValue::parse(&text).unwrap(), sample());
    }

    #[test]
    fn out_of_order_fields_are_rejected() {
        let value = sample();
        let text = format!(
            "iv={};v=v2;ct={};tag={}",
            URL_SAFE_NO_PAD.encode(value.iv),
            URL_SAFE_NO_PAD.encode(&value.ciphertext),
            URL_SAFE_NO_PAD.encode(value.tag),
        );
        assert!(matches!(EncryptedValue::parse(&text), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn missing_tag_is_rejected() {
        let text = sample().to_string();
        let truncated = &text[..text.rfind(";tag=").unwrap()];
        assert!(matches!(EncryptedValue::parse(truncated), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn wrong_nonce_and_tag_lengths_are_rejected() {
        let encode = |n: usize| URL_SAFE_NO_PAD.encode(vec![0u8; n]);
        let short_iv = format!("v=v1;iv={};ct=AA;tag={}", encode(8), encode(16));
        let short_tag = format!("v=v1;iv={};ct=AA;tag={}", encode(12), encode(15));

        assert!(matches!(EncryptedValue::parse(&short_iv), Err(CryptoError::Malformed(_))));
        assert!(matches!(EncryptedValue::parse(&short_tag), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn padded_or_standard_base64_is_rejected() {
        let text = sample().to_string().replace(";ct=", ";ct=+/");
        assert!(matches!(EncryptedValue::parse(&text), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn invalid_version_is_rejected() {
        let text = sample().to_string().replacen("v=v2", "v=", 1);
        assert!(matches!(EncryptedValue::parse(&text), Err(CryptoError::InvalidKeyVersion(_))));
    }

    #[test]
    fn peek_version_reads_only_the_first_field() {
        assert_eq!(EncryptedValue::peek_version("v=k9;garbage").unwrap().as_str(), "k9");
        assert!(EncryptedValue::peek_version("iv=abc").is_err());
        assert!(EncryptedValue::peek_version("").is_err());
    }

    #[test]
    fn empty_plaintext_serializes_empty_ciphertext() {
        let mut value = sample();
        value.ciphertext.clear();
        let text = value.to_string();
        assert!(text.contains(";ct=;"));
        assert_eq!(EncryptedValue::parse(&text).unwrap(), value);
    }
}
