//! Contracts for the external collaborators the pipeline writes to.
//!
//! The pipeline never talks to a database or cache server directly; it only
//! needs a [`Store`] with an idempotent upsert and a [`Cache`] with TTL'd keys
//! and an atomic set-if-absent. Production deployments plug in their own
//! implementations; [`MemoryStore`] and [`MemoryCache`] are the in-process
//! reference implementations used by the binary and the tests.
//!
//! All calls from the pipeline go through the circuit-breaker adapters in
//! [`crate::circuit`], never through these traits directly.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod pattern;

pub use memory::{MemoryCache, MemoryStore};
pub use pattern::{glob_escape, glob_match};

/// Errors returned by a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend failed; the call may succeed if retried.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The store's circuit breaker is open; the call was not attempted.
    #[error("store circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
}

/// Errors returned by a [`Cache`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backend failed; the call may succeed if retried.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// The cache's circuit breaker is open; the call was not attempted.
    #[error("cache circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
}

/// Durable storage for processed business events.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or updates the record identified by `external_id`.
    ///
    /// Must be idempotent: repeated calls with the same `external_id` converge
    /// on a single record.
    async fn upsert(&self, external_id: &str, fields: Map<String, Value>) -> Result<(), StoreError>;
}

/// Shared key/value cache with per-key expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the value stored under `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Atomically stores `value` only if `key` is absent or expired.
    ///
    /// Returns `true` if this call stored the value.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Removes the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Lists live keys matching a glob pattern (`*` and `?` wildcards).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

#[async_trait]
impl<T: Store + ?Sized> Store for std::sync::Arc<T> {
    async fn upsert(&self, external_id: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        (**self).upsert(external_id, fields).await
    }
}

#[async_trait]
impl<T: Cache + ?Sized> Cache for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        (**self).delete(keys).await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        (**self).keys_matching(pattern).await
    }
}
