//! Queue administration endpoints.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::AppState;
use crate::queue::{CleanReport, DeadLetter, QueueError, QueueStats};
use crate::types::JobId;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("missing query parameter: {0}")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::InvalidJobId(_) | AdminError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            AdminError::Queue(QueueError::NotFound(_)) => StatusCode::NOT_FOUND,
            AdminError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub async fn stats_handler(State(app_state): State<AppState>) -> Result<Json<QueueStats>, AdminError> {
    Ok(Json(app_state.queue().stats().await?))
}

pub async fn pause_handler(State(app_state): State<AppState>) -> Result<Json<QueueStats>, AdminError> {
    app_state.queue().pause().await?;
    Ok(Json(app_state.queue().stats().await?))
}

pub async fn resume_handler(State(app_state): State<AppState>) -> Result<Json<QueueStats>, AdminError> {
    app_state.queue().resume().await?;
    Ok(Json(app_state.queue().stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct CleanParams {
    pub older_than_secs: Option<u64>,
}

pub async fn clean_handler(
    State(app_state): State<AppState>,
    Query(params): Query<CleanParams>,
) -> Result<Json<CleanReport>, AdminError> {
    let secs = params
        .older_than_secs
        .ok_or(AdminError::MissingParameter("older_than_secs"))?;
    let report = app_state
        .queue()
        .clean_older_than(Duration::from_secs(secs))
        .await?;
    Ok(Json(report))
}

pub async fn dead_letters_handler(
    State(app_state): State<AppState>,
) -> Result<Json<Vec<DeadLetter>>, AdminError> {
    Ok(Json(app_state.queue().dead_letters().await?))
}

#[derive(Debug, Serialize)]
pub struct Requeued {
    pub job_id: JobId,
}

pub async fn retry_dead_letter_handler(
    State(app_state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Requeued>), AdminError> {
    let id = JobId::parse(&job_id).ok_or(AdminError::InvalidJobId(job_id))?;
    let job_id = app_state.queue().retry_dead_letter(id).await?;
    info!(%job_id, "dead-lettered job retried by operator");
    Ok((StatusCode::ACCEPTED, Json(Requeued { job_id })))
}
