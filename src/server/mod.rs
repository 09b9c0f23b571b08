//! HTTP surface: webhook intake, queue administration and health.
//!
//! # Endpoints
//!
//! - `POST /webhooks/{endpoint}` - Accepts a provider delivery (returns 202 Accepted)
//! - `GET /api/v1/queue/stats` - Job counts by state
//! - `POST /api/v1/queue/pause`, `POST /api/v1/queue/resume`
//! - `POST /api/v1/queue/clean?older_than_secs=N` - Drops old terminal records
//! - `GET /api/v1/queue/dead-letters`
//! - `POST /api/v1/queue/dead-letters/{job_id}/retry`
//! - `GET /api/v1/circuits` - Breaker state per dependency
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

use crate::circuit::CircuitBreaker;
use crate::queue::QueueBackend;

pub mod health;
pub mod queue;
pub mod webhook;

pub use health::{circuits_handler, health_handler};
pub use queue::{
    clean_handler, dead_letters_handler, pause_handler, resume_handler, retry_dead_letter_handler,
    stats_handler,
};
pub use webhook::webhook_handler;

/// Shared application state, passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    queue: Arc<dyn QueueBackend>,
    breakers: Vec<Arc<CircuitBreaker>>,
}

impl AppState {
    pub fn new(queue: Arc<dyn QueueBackend>, breakers: Vec<Arc<CircuitBreaker>>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { queue, breakers }),
        }
    }

    pub fn queue(&self) -> &dyn QueueBackend {
        self.inner.queue.as_ref()
    }

    pub fn breakers(&self) -> &[Arc<CircuitBreaker>] {
        &self.inner.breakers
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhooks/{endpoint}", post(webhook_handler))
        .route("/api/v1/queue/stats", get(stats_handler))
        .route("/api/v1/queue/pause", post(pause_handler))
        .route("/api/v1/queue/resume", post(resume_handler))
        .route("/api/v1/queue/clean", post(clean_handler))
        .route("/api/v1/queue/dead-letters", get(dead_letters_handler))
        .route(
            "/api/v1/queue/dead-letters/{job_id}/retry",
            post(retry_dead_letter_handler),
        )
        .route("/api/v1/circuits", get(circuits_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
