//! Core domain models, errors and persistence for the palisade middleware.
//!
//! Provides strongly-typed identifiers, the hash-chained audit entry, the
//! service-wide error taxonomy, the clock abstraction, PII masking and the
//! PostgreSQL repositories every other crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod masking;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, PalisadeError, Result};
pub use models::{
    verify_chain, ArtifactId, AuditEvent, AuditLogEntry, AuditResult, ChainViolation,
    EvidenceArtifact, IdempotencyRecord, RateLimitBucket, RateLimitKey, TenantId,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
