use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{SecretError, SecretRecord};

/// The authoritative source of signing secrets.
///
/// Implementations return the secrets of **all** endpoints in one call; the
/// cache never asks for a single endpoint.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SecretRecord>, SecretError>;
}

/// A provider serving a fixed set of secrets, typically from configuration.
#[derive(Debug, Default)]
pub struct StaticSecretProvider {
    records: Vec<SecretRecord>,
    loads: AtomicUsize,
}

impl StaticSecretProvider {
    pub fn new(records: Vec<SecretRecord>) -> Self {
        StaticSecretProvider {
            records,
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of `load_all` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn load_all(&self) -> Result<Vec<SecretRecord>, SecretError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.clone())
    }
}
