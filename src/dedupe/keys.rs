//! Dedup key derivation.
//!
//! Each identity signal an event carries becomes one key, namespaced by kind
//! and hashed together with the issuing endpoint so identical ids from
//! different providers never collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::CanonicalEvent;

/// The identity signal a dedup key was derived from.
///
/// Declaration order is the claim order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupKind {
    Transaction,
    Composite,
    Payload,
    MerchantRef,
    Envelope,
}

impl DedupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupKind::Transaction => "transaction",
            DedupKind::Composite => "composite",
            DedupKind::Payload => "payload",
            DedupKind::MerchantRef => "merchant_ref",
            DedupKind::Envelope => "envelope",
        }
    }
}

impl fmt::Display for DedupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A namespaced, hashed cache key for one identity signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub kind: DedupKind,
    pub key: String,
}

impl DedupKey {
    fn derive(source: &str, kind: DedupKind, value: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [source, kind.as_str(), value] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        DedupKey {
            kind,
            key: format!("dedup:{}:{}", kind, hex::encode(hasher.finalize())),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Derives every dedup key available for `event`, in claim order.
///
/// The envelope key is always present; the others depend on which identity
/// fields the payload carries.
pub fn dedup_keys(event: &CanonicalEvent) -> Vec<DedupKey> {
    let source = event.source().as_str();
    let mut keys = Vec::with_capacity(5);

    if let Some(tx) = event.provider_transaction_id() {
        keys.push(DedupKey::derive(source, DedupKind::Transaction, tx));
    }
    if let (Some(payload_id), Some(tx)) = (event.payload_id(), event.provider_transaction_id()) {
        let composite = format!("{payload_id}\u{0}{tx}");
        keys.push(DedupKey::derive(source, DedupKind::Composite, &composite));
    }
    if let Some(payload_id) = event.payload_id() {
        keys.push(DedupKey::derive(source, DedupKind::Payload, payload_id));
    }
    if let Some(merchant_ref) = event.merchant_ref() {
        keys.push(DedupKey::derive(source, DedupKind::MerchantRef, merchant_ref));
    }

    let envelope = format!("{}\u{0}{}", event.id(), event.signature().unwrap_or(""));
    keys.push(DedupKey::derive(source, DedupKind::Envelope, &envelope));

    keys
}
