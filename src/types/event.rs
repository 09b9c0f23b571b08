//! The canonical event handed from ingress to the pipeline.
//!
//! Payloads vary per provider and per event type, so the payload is kept as an
//! opaque JSON map. Identity fields are extracted once at construction; typed
//! projections such as [`PaymentProjection`] are validated lazily, only by the
//! stage that consumes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::ids::{CompanyId, Endpoint, EventId};

/// Errors describing a structurally unusable event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// A required identity field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Field names searched for the provider transaction id.
const TRANSACTION_ID_FIELDS: &[&str] = &["transaction_id", "transactionId", "provider_transaction_id"];
/// Field names searched for the merchant reference.
const MERCHANT_REF_FIELDS: &[&str] = &["merchant_reference", "merchantReference", "merchant_ref", "merchantRef"];
/// Field names searched for the tenant scope.
const COMPANY_ID_FIELDS: &[&str] = &["company_id", "companyId", "tenant_id", "tenantId"];

/// An inbound webhook event in canonical form.
///
/// Immutable once constructed: fields are private and only exposed by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    id: EventId,
    event_type: String,
    source: Endpoint,
    payload: Map<String, Value>,
    received_at: DateTime<Utc>,
    #[serde(with = "hex::serde")]
    raw_body: Vec<u8>,
    signature: Option<String>,
    provider_transaction_id: Option<String>,
    merchant_ref: Option<String>,
    payload_id: Option<String>,
    company_id: Option<CompanyId>,
}

impl CanonicalEvent {
    /// Builds a canonical event, extracting identity fields from the payload.
    ///
    /// Identity fields are looked up at the top level of the payload, then under
    /// `data`, then under `data.object`, which covers the common provider layouts.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingField`] if `id`, `event_type` or `source` is empty.
    pub fn new(
        id: EventId,
        event_type: impl Into<String>,
        source: Endpoint,
        payload: Map<String, Value>,
        received_at: DateTime<Utc>,
        raw_body: impl Into<Vec<u8>>,
        signature: Option<String>,
    ) -> Result<Self, EventError> {
        let event_type = event_type.into();
        if id.as_str().trim().is_empty() {
            return Err(EventError::MissingField("id"));
        }
        if event_type.trim().is_empty() {
            return Err(EventError::MissingField("eventType"));
        }
        if source.as_str().trim().is_empty() {
            return Err(EventError::MissingField("source"));
        }

        let provider_transaction_id = lookup_string(&payload, TRANSACTION_ID_FIELDS);
        let merchant_ref = lookup_string(&payload, MERCHANT_REF_FIELDS);
        let payload_id = nested_id(&payload);
        let company_id = lookup_string(&payload, COMPANY_ID_FIELDS).map(CompanyId::new);

        Ok(CanonicalEvent {
            id,
            event_type,
            source,
            payload,
            received_at,
            raw_body: raw_body.into(),
            signature: signature.filter(|s| !s.trim().is_empty()),
            provider_transaction_id,
            merchant_ref,
            payload_id,
            company_id,
        })
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &Endpoint {
        &self.source
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn provider_transaction_id(&self) -> Option<&str> {
        self.provider_transaction_id.as_deref()
    }

    pub fn merchant_ref(&self) -> Option<&str> {
        self.merchant_ref.as_deref()
    }

    /// The id of the business object inside the payload (`data.id` or `data.object.id`).
    pub fn payload_id(&self) -> Option<&str> {
        self.payload_id.as_deref()
    }

    pub fn company_id(&self) -> Option<&CompanyId> {
        self.company_id.as_ref()
    }

    /// The identity under which this event is persisted.
    ///
    /// Redeliveries of the same business event must converge on the same row,
    /// so the most stable identity available wins: transaction id, then payload
    /// id, then merchant reference, then the envelope id.
    pub fn external_id(&self) -> &str {
        self.provider_transaction_id
            .as_deref()
            .or(self.payload_id.as_deref())
            .or(self.merchant_ref.as_deref())
            .unwrap_or(self.id.as_str())
    }

    /// Projects the monetary fields of the payload.
    ///
    /// Returns `Ok(None)` if the payload carries neither an amount nor a
    /// currency. Amounts are integers in minor units and may be sent as JSON
    /// numbers or numeric strings.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of the two fields is present or either is malformed.
    pub fn payment(&self) -> Result<Option<PaymentProjection>, EventError> {
        let amount = lookup(&self.payload, &["amount"]);
        let currency = lookup(&self.payload, &["currency"]);

        match (amount, currency) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(EventError::MissingField("amount")),
            (Some(_), None) => Err(EventError::MissingField("currency")),
            (Some(amount), Some(currency)) => {
                let amount_minor = parse_amount(amount)?;
                let currency = currency
                    .as_str()
                    .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
                    .ok_or_else(|| EventError::InvalidField {
                        field: "currency",
                        reason: "expected a three-letter ISO 4217 code".to_string(),
                    })?;
                Ok(Some(PaymentProjection {
                    amount_minor,
                    currency: currency.to_ascii_uppercase(),
                }))
            }
        }
    }
}

/// Typed view of the monetary fields of a payment-related payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProjection {
    /// Amount in minor currency units (e.g. cents).
    pub amount_minor: i64,
    /// Upper-case ISO 4217 code.
    pub currency: String,
}

fn parse_amount(value: &Value) -> Result<i64, EventError> {
    let invalid = || EventError::InvalidField {
        field: "amount",
        reason: "expected an integer amount in minor units".to_string(),
    };
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(invalid),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Values of the named fields in the payload's top level, then `data`, then
/// `data.object`, in that order.
fn candidates<'a>(
    payload: &'a Map<String, Value>,
    names: &'a [&'a str],
) -> impl Iterator<Item = &'a Value> {
    let data = payload.get("data").and_then(Value::as_object);
    let object = data.and_then(|d| d.get("object")).and_then(Value::as_object);

    [Some(payload), data, object]
        .into_iter()
        .flatten()
        .flat_map(move |map| names.iter().filter_map(move |name| map.get(*name)))
}

/// The first non-null value among the named fields.
fn lookup<'a>(payload: &'a Map<String, Value>, names: &'a [&'a str]) -> Option<&'a Value> {
    candidates(payload, names).find(|v| !v.is_null())
}

/// Like [`lookup`], but coerces numbers to strings and skips null or blank values.
fn lookup_string(payload: &Map<String, Value>, names: &[&str]) -> Option<String> {
    candidates(payload, names).find_map(value_to_identity)
}

fn nested_id(payload: &Map<String, Value>) -> Option<String> {
    let data = payload.get("data").and_then(Value::as_object)?;
    data.get("object")
        .and_then(Value::as_object)
        .and_then(|o| o.get("id"))
        .and_then(value_to_identity)
        .or_else(|| data.get("id").and_then(value_to_identity))
}

fn value_to_identity(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
