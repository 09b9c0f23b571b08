//! Shared fixtures for unit and scenario tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::backends::{Cache, CacheError, MemoryCache, MemoryStore, Store, StoreError};
use crate::queue::DeadLetter;
use crate::secrets::{SecretError, SecretProvider, SecretRecord};
use crate::types::{CanonicalEvent, Endpoint, EventId};
use crate::webhooks::{SignatureAlgorithm, compute_signature, format_signature};
use crate::worker::AlertSink;

/// Endpoint used by [`event_builder`] unless overridden.
pub const TEST_ENDPOINT: &str = "acme";

/// Key that [`event_builder`] signs bodies with.
pub const TEST_SECRET: &[u8] = b"acme-signing-key";

/// The secret record matching [`TEST_SECRET`] for `endpoint`.
pub fn test_secret(endpoint: &str) -> SecretRecord {
    SecretRecord::new(Endpoint::new(endpoint), TEST_SECRET.to_vec(), SignatureAlgorithm::Sha256)
}

pub fn event_builder(id: &str, event_type: &str) -> EventBuilder {
    EventBuilder {
        id: id.to_string(),
        event_type: event_type.to_string(),
        endpoint: TEST_ENDPOINT.to_string(),
        payload: Map::new(),
        signed: true,
        signature: None,
    }
}

/// Builds canonical events whose raw body is the serialized payload, signed
/// with [`TEST_SECRET`].
pub struct EventBuilder {
    id: String,
    event_type: String,
    endpoint: String,
    payload: Map<String, Value>,
    signed: bool,
    signature: Option<String>,
}

impl EventBuilder {
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.signed = false;
        self
    }

    /// Presents this signature verbatim instead of a valid one.
    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn build(self) -> CanonicalEvent {
        let raw_body = serde_json::to_vec(&self.payload).unwrap();
        let signature = match (self.signature, self.signed) {
            (Some(sig), _) => Some(sig),
            (None, true) => Some(format_signature(
                SignatureAlgorithm::Sha256,
                &compute_signature(SignatureAlgorithm::Sha256, &raw_body, TEST_SECRET),
            )),
            (None, false) => None,
        };
        CanonicalEvent::new(
            EventId::new(self.id),
            self.event_type,
            Endpoint::new(self.endpoint),
            self.payload,
            Utc::now(),
            raw_body,
            signature,
        )
        .unwrap()
    }
}

/// A store that fails its first `n` upserts, then delegates to a [`MemoryStore`].
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    remaining_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FailingStore {
    pub fn always() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn failing_first(n: usize) -> Self {
        FailingStore {
            remaining_failures: AtomicUsize::new(n),
            ..Default::default()
        }
    }

    /// Stops failing.
    pub fn heal(&self) {
        self.remaining_failures.store(0, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn upsert(&self, external_id: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failed {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.upsert(external_id, fields).await
    }
}

/// A cache whose every call fails.
#[derive(Default)]
pub struct FailingCache {
    calls: AtomicUsize,
}

impl FailingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Backend("cache unreachable".to_string()))
    }
}

#[async_trait]
impl Cache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        self.fail()
    }

    async fn set_with_ttl(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        self.fail()
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.fail()
    }

    async fn delete(&self, _keys: &[String]) -> Result<usize, CacheError> {
        self.fail()
    }

    async fn keys_matching(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
        self.fail()
    }
}

/// A [`MemoryCache`] that counts reads.
#[derive(Default)]
pub struct CountingCache {
    inner: MemoryCache,
    gets: AtomicUsize,
}

impl CountingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cache for CountingCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        self.inner.delete(keys).await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys_matching(pattern).await
    }
}

/// A secret provider whose records, latency and health can be changed mid-test.
pub struct ScriptedSecretProvider {
    records: Mutex<Vec<SecretRecord>>,
    delay: Option<Duration>,
    failing: AtomicBool,
    loads: AtomicUsize,
}

impl ScriptedSecretProvider {
    pub fn new(records: Vec<SecretRecord>) -> Self {
        ScriptedSecretProvider {
            records: Mutex::new(records),
            delay: None,
            failing: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_records(&self, records: Vec<SecretRecord>) {
        *self.records.lock() = records;
    }

    /// Load attempts so far, failed ones included.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for ScriptedSecretProvider {
    async fn load_all(&self) -> Result<Vec<SecretRecord>, SecretError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SecretError::Provider("vault unavailable".to_string()));
        }
        Ok(self.records.lock().clone())
    }
}

/// Collects dead-letter alerts for assertions.
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<DeadLetter>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<DeadLetter> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn dead_lettered(&self, dead_letter: &DeadLetter) {
        self.alerts.lock().push(dead_letter.clone());
    }
}
