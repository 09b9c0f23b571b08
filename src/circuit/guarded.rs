//! Breaker-protected adapters for the [`Store`] and [`Cache`] contracts.
//!
//! The pipeline holds these wrappers instead of the raw collaborators, so
//! every call into shared storage is admitted (or fast-failed) by the
//! dependency's breaker. An open circuit surfaces as the collaborator's own
//! `CircuitOpen` error variant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::backends::{Cache, CacheError, Store, StoreError};

use super::breaker::{CircuitBreaker, CircuitError};

/// A [`Store`] whose calls pass through a circuit breaker.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn Store>, breaker: Arc<CircuitBreaker>) -> Self {
        GuardedStore { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

fn store_error(err: CircuitError<StoreError>) -> StoreError {
    match err {
        CircuitError::Open { retry_after, .. } => StoreError::CircuitOpen { retry_after },
        CircuitError::Inner(e) => e,
    }
}

#[async_trait]
impl Store for GuardedStore {
    async fn upsert(&self, external_id: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.breaker
            .execute(|| self.inner.upsert(external_id, fields))
            .await
            .map_err(store_error)
    }
}

/// A [`Cache`] whose calls pass through a circuit breaker.
#[derive(Clone)]
pub struct GuardedCache {
    inner: Arc<dyn Cache>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedCache {
    pub fn new(inner: Arc<dyn Cache>, breaker: Arc<CircuitBreaker>) -> Self {
        GuardedCache { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

fn cache_error(err: CircuitError<CacheError>) -> CacheError {
    match err {
        CircuitError::Open { retry_after, .. } => CacheError::CircuitOpen { retry_after },
        CircuitError::Inner(e) => e,
    }
}

#[async_trait]
impl Cache for GuardedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.breaker
            .execute(|| self.inner.get(key))
            .await
            .map_err(cache_error)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.breaker
            .execute(|| self.inner.set_with_ttl(key, value, ttl))
            .await
            .map_err(cache_error)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.breaker
            .execute(|| self.inner.set_if_absent(key, value, ttl))
            .await
            .map_err(cache_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        self.breaker
            .execute(|| self.inner.delete(keys))
            .await
            .map_err(cache_error)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.breaker
            .execute(|| self.inner.keys_matching(pattern))
            .await
            .map_err(cache_error)
    }
}
