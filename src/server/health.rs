//! Health check and dependency breaker inspection.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use super::AppState;
use crate::circuit::CircuitSnapshot;

/// Health check handler.
///
/// Returns 200 OK with the text "OK" while the process is serving requests.
/// Open breakers do not fail the check; intake keeps accepting deliveries
/// while dependencies recover.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    #[serde(flatten)]
    pub snapshot: CircuitSnapshot,
}

pub async fn circuits_handler(State(app_state): State<AppState>) -> Json<Vec<CircuitStatus>> {
    Json(
        app_state
            .breakers()
            .iter()
            .map(|b| CircuitStatus {
                name: b.name().to_string(),
                snapshot: b.snapshot(),
            })
            .collect(),
    )
}
