//! Palisade HTTP API.
//!
//! Axum surface over the guards: authenticated webhook intake, evidence
//! grants behind the rate limiter, and health probes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::ApiError;
pub use server::{create_router, shutdown_signal, start_server};
pub use state::{AppState, HttpSettings};
