//! Webhook intake.
//!
//! Deliveries are parsed into canonical events and enqueued before returning
//! 202 Accepted. Signature verification, deduplication and persistence all
//! happen asynchronously in the worker pool, so a provider's delivery is
//! acknowledged as soon as it is durable.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::queue::QueueError;
use crate::types::{Endpoint, JobId};
use crate::webhooks::ingress::{EVENT_HEADER, ID_HEADER, SIGNATURE_HEADER};
use crate::webhooks::{IngressError, RawDelivery, parse_delivery};

/// Errors that can occur when accepting a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid endpoint name: {0:?}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Malformed(#[from] IngressError),

    #[error("failed to enqueue delivery: {0}")]
    Queue(#[from] QueueError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidEndpoint(_) | WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebhookError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub job_id: JobId,
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST, path `/webhooks/{endpoint}`
/// - Optional headers (each falls back to the body):
///   - `X-Webhook-Id`: envelope id (body `id`)
///   - `X-Webhook-Event`: event type (body `type`, `event_type` or `eventType`)
///   - `X-Webhook-Signature`: `sha256=<hex>` HMAC of the raw body
/// - Body: JSON object
///
/// # Response
///
/// - 202 Accepted: `{"job_id": "..."}`
/// - 400 Bad Request: malformed body or missing identity
/// - 500 Internal Server Error: the job could not be made durable
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), WebhookError> {
    validate_endpoint(&endpoint)?;
    let endpoint = Endpoint::new(endpoint);

    let mut delivery = RawDelivery::new(body.to_vec());
    if let Some(id) = header(&headers, ID_HEADER) {
        delivery = delivery.with_envelope_id(id);
    }
    if let Some(event_type) = header(&headers, EVENT_HEADER) {
        delivery = delivery.with_event_type(event_type);
    }
    if let Some(signature) = header(&headers, SIGNATURE_HEADER) {
        delivery = delivery.with_signature(signature);
    }

    let event = parse_delivery(endpoint.clone(), delivery, Utc::now()).inspect_err(|e| {
        warn!(%endpoint, error = %e, "rejecting malformed delivery");
    })?;
    debug!(%endpoint, event_id = %event.id(), event_type = event.event_type(), "received webhook");

    let event_id = event.id().clone();
    let job_id = app_state.queue().enqueue(event).await?;
    info!(%endpoint, %event_id, %job_id, "webhook accepted");

    Ok((StatusCode::ACCEPTED, Json(Accepted { job_id })))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Endpoint names key secrets and dedup records, so only a conservative
/// character set is accepted.
fn validate_endpoint(name: &str) -> Result<(), WebhookError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WebhookError::InvalidEndpoint(name.to_string()))
    }
}
