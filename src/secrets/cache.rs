//! A three-layer cache of signing secrets with single-flight refresh.
//!
//! Lookups go memory → shared cache → provider. All layers hold the whole
//! batch (every endpoint's secret) and share one TTL. Refreshes are serialized
//! behind an async mutex that also remembers the outcome of the last attempt,
//! so callers that queued up behind an in-flight refresh adopt its result
//! instead of issuing their own load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backends::Cache;
use crate::types::Endpoint;

use super::{SecretError, SecretProvider, SecretRecord};

/// Refresh TTL shared by all layers.
pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(30 * 60);

/// Minimum age of the batch before an unknown endpoint forces a reload.
pub const DEFAULT_MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Shared-cache key holding the serialized batch.
pub const SHARED_CACHE_KEY: &str = "secrets:all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretCacheConfig {
    pub ttl: Duration,
    pub min_reload_interval: Duration,
}

impl Default for SecretCacheConfig {
    fn default() -> Self {
        SecretCacheConfig {
            ttl: DEFAULT_SECRET_TTL,
            min_reload_interval: DEFAULT_MIN_RELOAD_INTERVAL,
        }
    }
}

struct Batch {
    records: HashMap<Endpoint, SecretRecord>,
    loaded_at: Instant,
    fresh_until: Instant,
}

impl Batch {
    fn new(records: Vec<SecretRecord>, now: Instant, fresh_for: Duration) -> Self {
        Batch {
            records: records
                .into_iter()
                .map(|r| (r.endpoint().clone(), r))
                .collect(),
            loaded_at: now,
            fresh_until: now + fresh_for,
        }
    }
}

/// The batch as stored in the shared cache.
#[derive(Serialize, Deserialize)]
struct SharedBatch {
    records: Vec<SecretRecord>,
    loaded_at: DateTime<Utc>,
}

/// Outcome of the most recent refresh, kept under the refresh lock.
struct Attempt {
    at: Instant,
    outcome: Result<(), SecretError>,
}

enum Lookup {
    Hit(SecretRecord),
    Unknown { age: Duration },
    Stale,
    Empty,
}

pub struct SecretCache {
    provider: Arc<dyn SecretProvider>,
    shared: Option<Arc<dyn Cache>>,
    config: SecretCacheConfig,
    batch: RwLock<Option<Batch>>,
    refresh: Mutex<Option<Attempt>>,
}

impl SecretCache {
    pub fn new(
        provider: Arc<dyn SecretProvider>,
        shared: Option<Arc<dyn Cache>>,
        config: SecretCacheConfig,
    ) -> Self {
        SecretCache {
            provider,
            shared,
            config,
            batch: RwLock::new(None),
            refresh: Mutex::new(None),
        }
    }

    /// Returns the secret for `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`SecretError::UnknownEndpoint`] if the endpoint is absent from a freshly
    ///   loaded batch. There is no fallback key.
    /// - [`SecretError::Provider`] if no batch is cached and loading one fails.
    pub async fn get(&self, endpoint: &Endpoint) -> Result<SecretRecord, SecretError> {
        let requested_at = Instant::now();
        match self.lookup(endpoint, requested_at).await {
            Lookup::Hit(record) => return Ok(record),
            Lookup::Unknown { age } if age < self.config.min_reload_interval => {
                return Err(SecretError::UnknownEndpoint(endpoint.clone()));
            }
            Lookup::Unknown { .. } => self.refresh(requested_at, true).await?,
            Lookup::Stale | Lookup::Empty => self.refresh(requested_at, false).await?,
        }

        self.batch
            .read()
            .await
            .as_ref()
            .and_then(|b| b.records.get(endpoint).cloned())
            .ok_or_else(|| SecretError::UnknownEndpoint(endpoint.clone()))
    }

    /// Drops the in-memory batch so the next lookup refreshes.
    pub async fn invalidate(&self) {
        let mut last = self.refresh.lock().await;
        *self.batch.write().await = None;
        *last = None;
    }

    async fn lookup(&self, endpoint: &Endpoint, now: Instant) -> Lookup {
        let batch = self.batch.read().await;
        match batch.as_ref() {
            None => Lookup::Empty,
            Some(b) if b.fresh_until <= now => Lookup::Stale,
            Some(b) => match b.records.get(endpoint) {
                Some(record) => Lookup::Hit(record.clone()),
                None => Lookup::Unknown {
                    age: now.duration_since(b.loaded_at),
                },
            },
        }
    }

    /// Refreshes the batch unless another caller already did since `requested_at`.
    ///
    /// `from_source` skips the shared cache and goes straight to the provider.
    async fn refresh(&self, requested_at: Instant, from_source: bool) -> Result<(), SecretError> {
        let mut last = self.refresh.lock().await;
        if let Some(attempt) = last.as_ref()
            && attempt.at >= requested_at
        {
            debug!("secret refresh already completed by another caller");
            return attempt.outcome.clone();
        }

        let outcome = self.load(from_source).await;
        *last = Some(Attempt {
            at: Instant::now(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn load(&self, from_source: bool) -> Result<(), SecretError> {
        if !from_source && self.adopt_shared().await {
            return Ok(());
        }

        match self.provider.load_all().await {
            Ok(records) => {
                info!(endpoints = records.len(), "loaded signing secrets");
                self.publish_shared(&records).await;
                let batch = Batch::new(records, Instant::now(), self.config.ttl);
                *self.batch.write().await = Some(batch);
                Ok(())
            }
            Err(e) => {
                if self.batch.read().await.is_some() {
                    warn!(error = %e, "secret refresh failed, serving stale secrets");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Installs the shared-cache batch if it is present and unexpired.
    async fn adopt_shared(&self) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };
        let raw = match shared.get(SHARED_CACHE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "shared secret cache unavailable");
                return false;
            }
        };
        let batch: SharedBatch = match serde_json::from_str(&raw) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable shared secret batch");
                return false;
            }
        };

        let age = (Utc::now() - batch.loaded_at).to_std().unwrap_or_default();
        let Some(remaining) = self.config.ttl.checked_sub(age).filter(|r| !r.is_zero()) else {
            return false;
        };

        debug!(endpoints = batch.records.len(), "adopted signing secrets from shared cache");
        *self.batch.write().await = Some(Batch::new(batch.records, Instant::now(), remaining));
        true
    }

    async fn publish_shared(&self, records: &[SecretRecord]) {
        let Some(shared) = &self.shared else {
            return;
        };
        let batch = SharedBatch {
            records: records.to_vec(),
            loaded_at: Utc::now(),
        };
        let raw = match serde_json::to_string(&batch) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize secret batch");
                return;
            }
        };
        if let Err(e) = shared.set_with_ttl(SHARED_CACHE_KEY, raw, self.config.ttl).await {
            warn!(error = %e, "failed to publish secrets to shared cache");
        }
    }
}
