//! Cryptographic primitives for the palisade middleware.
//!
//! - [`signature`]: HMAC-SHA256 webhook signatures with timestamp skew
//!   bounds and constant-time comparison.
//! - [`engine`]: AES-256-GCM column encryption over versioned keys from a
//!   [`KeyRegistry`], serialized as [`EncryptedValue`].
//! - [`rotation`]: background re-encryption sweep and guarded key
//!   retirement.
//! - [`evidence`]: integrity re-check of stored artifacts before issuing
//!   signed access grants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod envelope;
pub mod error;
pub mod evidence;
pub mod keys;
pub mod rotation;
pub mod signature;

pub use engine::ColumnEncryptionEngine;
pub use envelope::EncryptedValue;
pub use error::{CryptoError, Result};
pub use evidence::{
    EvidenceGate, FsObjectStore, GrantSigner, MemoryObjectStore, ObjectStore, SignedGrant,
};
pub use keys::{DataKey, EnvKeyRegistry, KeyRegistry, KeyVersion, StaticKeyRegistry};
pub use rotation::{
    ColumnTarget, EncryptedColumnStore, KeyRetirement, PgEncryptedColumnStore, RotationSweep,
    SweepReport,
};
pub use signature::{
    sign, verify, verify_at, verify_webhook, SignatureError, SignatureVerifier, VerifiedWebhook,
};
