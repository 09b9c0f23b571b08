//! Webhook handling for payment-provider deliveries.
//!
//! This module provides:
//! - Signature verification for webhook payloads (HMAC-SHA256/512)
//! - Parsing of raw deliveries into canonical events
//! - Priority classification for queue scheduling

pub mod ingress;
pub mod priority;
pub mod signature;

pub use ingress::{IngressError, RawDelivery, parse_delivery};
pub use priority::{EventPriority, classify_priority};
pub use signature::{
    SignatureAlgorithm, compute_signature, format_signature, parse_signature, verify_signature,
};
