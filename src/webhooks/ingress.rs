//! Building canonical events from raw webhook deliveries.
//!
//! A delivery is the raw request body plus a handful of headers. Providers
//! disagree on where the envelope id and event type live, so headers win and
//! the body is consulted as a fallback:
//!
//! | Field       | Header                | Body fallback                         |
//! |-------------|-----------------------|---------------------------------------|
//! | envelope id | `x-webhook-id`        | `id`                                  |
//! | event type  | `x-webhook-event`     | `type`, `event_type`, `eventType`     |
//! | signature   | `x-webhook-signature` | none                                  |
//!
//! Malformed deliveries are rejected here and never reach the queue.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{CanonicalEvent, Endpoint, EventError, EventId};

pub const ID_HEADER: &str = "x-webhook-id";
pub const EVENT_HEADER: &str = "x-webhook-event";
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

const EVENT_TYPE_FIELDS: &[&str] = &["type", "event_type", "eventType"];

/// Reasons a delivery cannot become a [`CanonicalEvent`].
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("body must be a JSON object")]
    NotAnObject,

    #[error(transparent)]
    Event(#[from] EventError),
}

/// A webhook delivery as received, before any interpretation.
#[derive(Debug, Clone, Default)]
pub struct RawDelivery {
    pub envelope_id: Option<String>,
    pub event_type: Option<String>,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

impl RawDelivery {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        RawDelivery {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_envelope_id(mut self, id: impl Into<String>) -> Self {
        self.envelope_id = Some(id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

/// Parses a delivery that arrived on `endpoint` into a canonical event.
///
/// The raw body is kept byte-for-byte so the signature can be recomputed.
///
/// # Errors
///
/// Returns an [`IngressError`] if the body is not a JSON object or the
/// envelope id or event type cannot be found in either headers or body.
pub fn parse_delivery(
    endpoint: Endpoint,
    delivery: RawDelivery,
    received_at: DateTime<Utc>,
) -> Result<CanonicalEvent, IngressError> {
    let payload: Value = serde_json::from_slice(&delivery.body)?;
    let Value::Object(payload) = payload else {
        return Err(IngressError::NotAnObject);
    };

    let id = non_empty(delivery.envelope_id)
        .or_else(|| body_string(&payload, &["id"]))
        .ok_or(EventError::MissingField("id"))?;
    let event_type = non_empty(delivery.event_type)
        .or_else(|| body_string(&payload, EVENT_TYPE_FIELDS))
        .ok_or(EventError::MissingField("eventType"))?;

    let event = CanonicalEvent::new(
        EventId::new(id),
        event_type,
        endpoint,
        payload,
        received_at,
        delivery.body,
        delivery.signature,
    )?;
    Ok(event)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn body_string(payload: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match payload.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(delivery: RawDelivery) -> Result<CanonicalEvent, IngressError> {
        parse_delivery(Endpoint::new("acme"), delivery, Utc::now())
    }

    #[test]
    fn headers_take_precedence_over_body() {
        let body = br#"{"id":"body-id","type":"body.type","transaction_id":"t1"}"#;
        let event = parse(
            RawDelivery::new(body.to_vec())
                .with_envelope_id("w1")
                .with_event_type("PAYMENT_COMPLETED")
                .with_signature("sha256=abcd"),
        )
        .unwrap();

        assert_eq!(event.id().as_str(), "w1");
        assert_eq!(event.event_type(), "PAYMENT_COMPLETED");
        assert_eq!(event.signature(), Some("sha256=abcd"));
        assert_eq!(event.provider_transaction_id(), Some("t1"));
        assert_eq!(event.raw_body(), body);
    }

    #[test]
    fn falls_back_to_body_fields() {
        let event = parse(RawDelivery::new(
            br#"{"id":"evt_1","event_type":"charge.succeeded"}"#.to_vec(),
        ))
        .unwrap();
        assert_eq!(event.id().as_str(), "evt_1");
        assert_eq!(event.event_type(), "charge.succeeded");
        assert_eq!(event.signature(), None);
    }

    #[test]
    fn blank_headers_fall_back_to_body() {
        let event = parse(
            RawDelivery::new(br#"{"id":"evt_1","type":"ping"}"#.to_vec())
                .with_envelope_id("  ")
                .with_event_type(""),
        )
        .unwrap();
        assert_eq!(event.id().as_str(), "evt_1");
        assert_eq!(event.event_type(), "ping");
    }

    #[test]
    fn rejects_invalid_json() {
        let err = parse(RawDelivery::new(b"not json".to_vec())).unwrap_err();
        assert!(matches!(err, IngressError::InvalidJson(_)));
    }

    #[test]
    fn rejects_non_object_body() {
        let err = parse(RawDelivery::new(b"[1,2,3]".to_vec())).unwrap_err();
        assert!(matches!(err, IngressError::NotAnObject));
    }

    #[test]
    fn rejects_missing_envelope_id() {
        let err = parse(RawDelivery::new(br#"{"type":"ping"}"#.to_vec())).unwrap_err();
        assert!(matches!(err, IngressError::Event(EventError::MissingField("id"))));
    }

    #[test]
    fn rejects_missing_event_type() {
        let err = parse(RawDelivery::new(br#"{"id":"evt_1"}"#.to_vec())).unwrap_err();
        assert!(matches!(
            err,
            IngressError::Event(EventError::MissingField("eventType"))
        ));
    }
}
