//! Signing secrets and signature validation.
//!
//! [`SecretCache`] batch-loads every endpoint's secret from a
//! [`SecretProvider`] and keeps it warm; [`SignatureValidator`] verifies
//! deliveries against it.

use thiserror::Error;

use crate::types::Endpoint;

pub mod cache;
pub mod provider;
pub mod record;
pub mod validator;

pub use cache::{
    DEFAULT_MIN_RELOAD_INTERVAL, DEFAULT_SECRET_TTL, SHARED_CACHE_KEY, SecretCache,
    SecretCacheConfig,
};
pub use provider::{SecretProvider, StaticSecretProvider};
pub use record::SecretRecord;
pub use validator::{SignatureError, SignatureValidator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// The secret source failed to load.
    #[error("secret provider error: {0}")]
    Provider(String),

    #[error("no secret configured for endpoint {0}")]
    UnknownEndpoint(Endpoint),

    #[error("invalid secret for endpoint {endpoint}: {reason}")]
    InvalidKey { endpoint: Endpoint, reason: String },
}
