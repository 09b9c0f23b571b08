use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::config::Environment;
use crate::types::Endpoint;
use crate::webhooks::verify_signature;

use super::{SecretCache, SecretError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature for endpoint {0}")]
    Missing(Endpoint),

    #[error("signature mismatch for endpoint {0}")]
    Mismatch(Endpoint),

    #[error("no signing secret for endpoint {0}")]
    UnknownEndpoint(Endpoint),

    /// Secrets could not be loaded; the delivery itself may be fine.
    #[error("signing secrets unavailable: {0}")]
    Unavailable(SecretError),
}

impl SignatureError {
    /// True if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SignatureError::Unavailable(_))
    }
}

/// Verifies delivery authenticity against the endpoint's cached secret.
pub struct SignatureValidator {
    secrets: Arc<SecretCache>,
    environment: Environment,
}

impl SignatureValidator {
    pub fn new(secrets: Arc<SecretCache>, environment: Environment) -> Self {
        SignatureValidator {
            secrets,
            environment,
        }
    }

    /// Checks `presented` against the HMAC of `raw_body` under the endpoint's key.
    ///
    /// An absent signature is rejected in production and let through with a
    /// warning elsewhere.
    pub async fn validate(
        &self,
        raw_body: &[u8],
        presented: Option<&str>,
        endpoint: &Endpoint,
    ) -> Result<(), SignatureError> {
        let Some(presented) = presented else {
            if self.environment.is_production() {
                return Err(SignatureError::Missing(endpoint.clone()));
            }
            warn!(%endpoint, environment = %self.environment, "accepting unsigned delivery outside production");
            return Ok(());
        };

        let secret = self.secrets.get(endpoint).await.map_err(|e| match e {
            SecretError::UnknownEndpoint(endpoint) => SignatureError::UnknownEndpoint(endpoint),
            other => SignatureError::Unavailable(other),
        })?;

        if verify_signature(secret.algorithm(), raw_body, presented, secret.key_material()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch(endpoint.clone()))
        }
    }

    /// Boolean form of [`validate`](Self::validate).
    pub async fn is_valid(&self, raw_body: &[u8], presented: Option<&str>, endpoint: &Endpoint) -> bool {
        self.validate(raw_body, presented, endpoint).await.is_ok()
    }
}
