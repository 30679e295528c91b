//! Async job routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::async_jobs::{AddJobResponse, AsyncJobError, AsyncJobRunner, StartJobRequest};
use crate::error::AppError;

pub fn async_jobs_routes() -> Router<AsyncJobRunner> {
    Router::new()
        .route("/", post(add_job))
        .route("/status", get(get_run_status))
        .route("/:job_id", get(get_job_status))
}

#[derive(Debug, Deserialize)]
pub struct RunStatusParams {
    pub source_id: String,
    pub destination_id: String,
    pub job_run_id: String,
    pub task_run_id: String,
}

/// POST /warehouse/jobs
///
/// Errors are reported in the `error` field alongside an empty `jobids`.
async fn add_job(
    State(runner): State<AsyncJobRunner>,
    Json(request): Json<StartJobRequest>,
) -> Response {
    match runner.enqueue(&request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            let status = match e {
                AsyncJobError::InvalidRequest(_) | AsyncJobError::NoTables { .. } => {
                    StatusCode::BAD_REQUEST
                },
                _ => {
                    tracing::error!(error = %e, "Failed to queue async jobs");
                    StatusCode::INTERNAL_SERVER_ERROR
                },
            };
            let body = AddJobResponse {
                jobids: Vec::new(),
                error: Some(e.to_string()),
            };
            (status, Json(body)).into_response()
        },
    }
}

/// GET /warehouse/jobs/:job_id
async fn get_job_status(
    State(runner): State<AsyncJobRunner>,
    Path(job_id): Path<i64>,
) -> Result<Response, AppError> {
    let status = runner.get_status(job_id).await?;
    Ok((StatusCode::OK, Json(status)).into_response())
}

/// GET /warehouse/jobs/status?source_id=&destination_id=&job_run_id=&task_run_id=
async fn get_run_status(
    State(runner): State<AsyncJobRunner>,
    Query(params): Query<RunStatusParams>,
) -> Result<Response, AppError> {
    let status = runner
        .get_status_by_run(
            &params.source_id,
            &params.destination_id,
            &params.job_run_id,
            &params.task_run_id,
        )
        .await?;
    Ok((StatusCode::OK, Json(status)).into_response())
}
