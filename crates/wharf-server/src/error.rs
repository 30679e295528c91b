//! HTTP-facing error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::async_jobs::AsyncJobError;
use crate::uploads::UploadError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<AsyncJobError> for AppError {
    fn from(err: AsyncJobError) -> Self {
        match err {
            AsyncJobError::InvalidRequest(message) => AppError::BadRequest(message),
            e @ AsyncJobError::NoTables { .. } => AppError::BadRequest(e.to_string()),
            e @ (AsyncJobError::NotFound(_) | AsyncJobError::RunNotFound { .. }) => {
                AppError::NotFound(e.to_string())
            },
            AsyncJobError::Store(e) => AppError::Database(e),
            e => AppError::Internal(e.to_string()),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            e @ UploadError::NotFound(_) => AppError::NotFound(e.to_string()),
            UploadError::Store(e) => AppError::Database(e),
            e => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            },
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
