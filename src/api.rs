//! REST endpoints for submitting jobs and polling their status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::{Job, JobManager, JobResult, JobStatus, Message};
use crate::worker::WorkerPool;

/// Maximum characters in one message.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Seconds a rejected caller should wait before retrying.
const RETRY_AFTER_SECS: &str = "1";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobManager>,
    pub pool: Arc<WorkerPool>,
}

/// Build the Axum router with the job REST routes.
pub fn job_routes(jobs: Arc<JobManager>, pool: Arc<WorkerPool>) -> Router {
    let state = AppState { jobs, pool };

    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SubmitRequest {
    /// Check the input constraints the queue relies on.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.messages.is_empty() {
            return Err(JobError::InvalidInput(
                "at least one message is required".to_string(),
            ));
        }
        for (i, message) in self.messages.iter().enumerate() {
            let chars = message.content.chars().count();
            if chars == 0 || chars > MAX_MESSAGE_CHARS {
                return Err(JobError::InvalidInput(format!(
                    "messages[{i}].content must be 1 to {MAX_MESSAGE_CHARS} characters"
                )));
            }
        }
        if let Some(metadata) = &self.metadata
            && !metadata.is_object()
        {
            return Err(JobError::InvalidInput(
                "metadata must be an object".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: Uuid,
    status: JobStatus,
    position: usize,
}

/// Body of `GET /api/jobs/{id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl JobStatusResponse {
    pub fn from_job(job: Job, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms: job.duration(now).map(|d| d.num_milliseconds()),
            result: job.result,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "convo-queue"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected malformed job submission");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if let Err(e) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let metadata = request.metadata.unwrap_or(serde_json::Value::Null);
    match state.jobs.submit(request.messages, metadata).await {
        Ok(job) => {
            // Not queued any more (already dispatched) reports as position 0
            let position = state.jobs.queue_position(job.id).await.unwrap_or(0);
            let status = state
                .jobs
                .get_job(job.id)
                .await
                .map_or(job.status, |current| current.status);
            info!(job_id = %job.id, position, "Job accepted");
            (
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    job_id: job.id,
                    status,
                    position,
                }),
            )
                .into_response()
        }
        Err(e @ JobError::QueueFull { .. }) => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid job ID"),
    };

    match state.jobs.get_job(job_id).await {
        Some(job) => Json(JobStatusResponse::from_job(job, Utc::now())).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            JobError::NotFound { id: job_id }.to_string(),
        ),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.stats().await)
}
