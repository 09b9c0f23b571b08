use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::types::Endpoint;
use crate::webhooks::SignatureAlgorithm;

use super::SecretError;

/// Prefix marking a base64-encoded signing secret.
const BASE64_PREFIX: &str = "whsec_";

/// Signing key material for one endpoint.
///
/// `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    endpoint: Endpoint,
    #[serde(with = "hex::serde")]
    key_material: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

impl SecretRecord {
    pub fn new(endpoint: Endpoint, key_material: impl Into<Vec<u8>>, algorithm: SignatureAlgorithm) -> Self {
        SecretRecord {
            endpoint,
            key_material: key_material.into(),
            algorithm,
        }
    }

    /// Builds a record from a secret as configured by an operator.
    ///
    /// `whsec_<base64>` secrets are base64-decoded; anything else is used as
    /// raw UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidKey`] for an empty secret or undecodable base64.
    pub fn from_encoded(
        endpoint: Endpoint,
        encoded: &str,
        algorithm: SignatureAlgorithm,
    ) -> Result<Self, SecretError> {
        let encoded = encoded.trim();
        let key_material = match encoded.strip_prefix(BASE64_PREFIX) {
            Some(b64) => STANDARD.decode(b64).map_err(|e| SecretError::InvalidKey {
                endpoint: endpoint.clone(),
                reason: format!("invalid base64: {e}"),
            })?,
            None => encoded.as_bytes().to_vec(),
        };
        if key_material.is_empty() {
            return Err(SecretError::InvalidKey {
                endpoint,
                reason: "empty secret".to_string(),
            });
        }
        Ok(SecretRecord::new(endpoint, key_material, algorithm))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("endpoint", &self.endpoint)
            .field("key_material", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whsec_secrets_are_base64_decoded() {
        let record = SecretRecord::from_encoded(
            Endpoint::new("acme"),
            "whsec_c2VjcmV0",
            SignatureAlgorithm::Sha256,
        )
        .unwrap();
        assert_eq!(record.key_material(), b"secret");
    }

    #[test]
    fn plain_secrets_are_raw_bytes() {
        let record =
            SecretRecord::from_encoded(Endpoint::new("acme"), "plain-key", SignatureAlgorithm::Sha512)
                .unwrap();
        assert_eq!(record.key_material(), b"plain-key");
        assert_eq!(record.algorithm(), SignatureAlgorithm::Sha512);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = SecretRecord::from_encoded(
            Endpoint::new("acme"),
            "whsec_***",
            SignatureAlgorithm::Sha256,
        )
        .unwrap_err();
        assert!(matches!(err, SecretError::InvalidKey { .. }));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = SecretRecord::from_encoded(Endpoint::new("acme"), "  ", SignatureAlgorithm::Sha256)
            .unwrap_err();
        assert!(matches!(err, SecretError::InvalidKey { .. }));
    }

    #[test]
    fn debug_redacts_key_material() {
        let record = SecretRecord::new(Endpoint::new("acme"), b"top-secret".to_vec(), SignatureAlgorithm::Sha256);
        let printed = format!("{record:?}");
        assert!(printed.contains("acme"));
        assert!(!printed.contains("top-secret"));
        assert!(!printed.contains(&hex::encode(b"top-secret")));
    }
}
