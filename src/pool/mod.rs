//! Bounded pooling of backend resources.
//!
//! A [`ResourcePool`] hands out at most `max_size` resources at a time. Idle
//! resources are health-checked on checkout and replaced if they fail; a
//! checked-out resource goes back to the idle list when its [`Pooled`] guard
//! drops. Pools of [`Store`]s and [`Cache`]s are themselves a `Store` or
//! `Cache`, so they slot in beneath the circuit-breaker adapters.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backends::{Cache, CacheError, Store, StoreError};
use crate::config::Environment;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a pooled resource")]
    Timeout(Duration),

    #[error("failed to create pooled resource: {0}")]
    Create(String),

    #[error("pool is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Creates and health-checks the resources a pool manages.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Resource: Send + Sync;
    type Error: fmt::Display + Send;

    async fn create(&self) -> std::result::Result<Self::Resource, Self::Error>;

    /// Returns false if `resource` should be discarded instead of reused.
    async fn check(&self, resource: &mut Self::Resource) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum resources checked out at once.
    pub max_size: usize,
    /// How long `acquire` waits for capacity.
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(max_size: usize) -> Self {
        PoolConfig {
            max_size: max_size.max(1),
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Sizing per deployment environment.
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::new(4),
            Environment::Staging => Self::new(8),
            Environment::Production => Self::new(16),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
}

pub struct ResourcePool<M: Manager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<Vec<M::Resource>>,
    permits: Semaphore,
}

impl<M: Manager> ResourcePool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        ResourcePool {
            manager,
            permits: Semaphore::new(config.max_size),
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Checks out a resource, waiting up to `acquire_timeout` for capacity.
    pub async fn acquire(&self) -> Result<Pooled<'_, M>> {
        let permit = timeout(self.config.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| PoolError::Timeout(self.config.acquire_timeout))?
            .map_err(|_| PoolError::Closed)?;

        let reused = self.idle.lock().pop();
        if let Some(mut resource) = reused {
            if self.manager.check(&mut resource).await {
                return Ok(Pooled::new(self, resource, permit));
            }
            debug!("discarding unhealthy pooled resource");
        }

        let resource = self.manager.create().await.map_err(|e| {
            warn!(error = %e, "failed to create pooled resource");
            PoolError::Create(e.to_string())
        })?;
        Ok(Pooled::new(self, resource, permit))
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.config.max_size,
            idle: self.idle.lock().len(),
            in_use: self.config.max_size - self.permits.available_permits(),
        }
    }

    /// Stops handing out resources. Pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }

    fn give_back(&self, resource: M::Resource) {
        if self.permits.is_closed() {
            return;
        }
        self.idle.lock().push(resource);
    }
}

/// A checked-out resource. Returned to the pool on drop.
pub struct Pooled<'a, M: Manager> {
    pool: &'a ResourcePool<M>,
    resource: Option<M::Resource>,
    _permit: SemaphorePermit<'a>,
}

impl<'a, M: Manager> Pooled<'a, M> {
    fn new(pool: &'a ResourcePool<M>, resource: M::Resource, permit: SemaphorePermit<'a>) -> Self {
        Pooled {
            pool,
            resource: Some(resource),
            _permit: permit,
        }
    }

    /// Drops the resource instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        self.resource = None;
    }

    /// Passes `result` through, discarding the resource if it is an error.
    pub fn settle<T, E>(self, result: std::result::Result<T, E>) -> std::result::Result<T, E> {
        if result.is_err() {
            debug!("discarding pooled resource after a failed call");
            self.discard();
        }
        result
    }
}

impl<M: Manager> Deref for Pooled<'_, M> {
    type Target = M::Resource;

    fn deref(&self) -> &M::Resource {
        // Only `discard` and `drop` take the resource, and both consume the guard.
        self.resource
            .as_ref()
            .expect("pooled resource present until the guard is consumed")
    }
}

impl<M: Manager> DerefMut for Pooled<'_, M> {
    fn deref_mut(&mut self) -> &mut M::Resource {
        self.resource
            .as_mut()
            .expect("pooled resource present until the guard is consumed")
    }
}

impl<M: Manager> Drop for Pooled<'_, M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.give_back(resource);
        }
    }
}

/// Manages handles to one shared in-process backend.
///
/// Each resource is a clone of the same `Arc`, so the pool bounds concurrent
/// use without creating anything new.
pub struct SharedManager<T: ?Sized> {
    shared: Arc<T>,
}

impl<T: ?Sized> SharedManager<T> {
    pub fn new(shared: Arc<T>) -> Self {
        SharedManager { shared }
    }
}

#[async_trait]
impl<T: ?Sized + Send + Sync + 'static> Manager for SharedManager<T> {
    type Resource = Arc<T>;
    type Error = std::convert::Infallible;

    async fn create(&self) -> std::result::Result<Arc<T>, Self::Error> {
        Ok(Arc::clone(&self.shared))
    }

    async fn check(&self, _resource: &mut Arc<T>) -> bool {
        true
    }
}

#[async_trait]
impl<M> Store for ResourcePool<M>
where
    M: Manager,
    M::Resource: Store,
{
    async fn upsert(&self, external_id: &str, fields: Map<String, Value>) -> std::result::Result<(), StoreError> {
        let store = self
            .acquire()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = store.upsert(external_id, fields).await;
        store.settle(result)
    }
}

#[async_trait]
impl<M> Cache for ResourcePool<M>
where
    M: Manager,
    M::Resource: Cache,
{
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, CacheError> {
        let cache = self.checkout_cache().await?;
        let result = cache.get(key).await;
        cache.settle(result)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> std::result::Result<(), CacheError> {
        let cache = self.checkout_cache().await?;
        let result = cache.set_with_ttl(key, value, ttl).await;
        cache.settle(result)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> std::result::Result<bool, CacheError> {
        let cache = self.checkout_cache().await?;
        let result = cache.set_if_absent(key, value, ttl).await;
        cache.settle(result)
    }

    async fn delete(&self, keys: &[String]) -> std::result::Result<usize, CacheError> {
        let cache = self.checkout_cache().await?;
        let result = cache.delete(keys).await;
        cache.settle(result)
    }

    async fn keys_matching(&self, pattern: &str) -> std::result::Result<Vec<String>, CacheError> {
        let cache = self.checkout_cache().await?;
        let result = cache.keys_matching(pattern).await;
        cache.settle(result)
    }
}

impl<M> ResourcePool<M>
where
    M: Manager,
    M::Resource: Cache,
{
    async fn checkout_cache(&self) -> std::result::Result<Pooled<'_, M>, CacheError> {
        self.acquire()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}
