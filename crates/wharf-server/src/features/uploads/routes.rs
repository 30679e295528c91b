//! Upload routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sqlx::PgPool;

use super::queries::{
    get_upload::handle as handle_get_upload, list_uploads::handle as handle_list_uploads,
    GetUploadError, GetUploadQuery, ListUploadsError, ListUploadsQuery,
};
use crate::error::AppError;

pub fn uploads_routes() -> Router<PgPool> {
    Router::new()
        .route("/", get(list_uploads))
        .route("/:upload_id", get(get_upload))
}

/// GET /uploads?source_id=&destination_id=&destination_type=&status=&limit=&offset=
async fn list_uploads(
    State(db): State<PgPool>,
    Query(query): Query<ListUploadsQuery>,
) -> Result<Response, AppError> {
    match handle_list_uploads(db, query).await {
        Ok(response) => Ok((StatusCode::OK, Json(response)).into_response()),
        Err(ListUploadsError::InvalidStatus(status)) => {
            Err(AppError::BadRequest(format!("Unknown upload status '{}'", status)))
        },
        Err(ListUploadsError::Database(e)) => Err(AppError::Database(e)),
    }
}

/// GET /uploads/:upload_id
async fn get_upload(
    State(db): State<PgPool>,
    Path(upload_id): Path<i64>,
) -> Result<Response, AppError> {
    match handle_get_upload(db, GetUploadQuery { upload_id }).await {
        Ok(details) => Ok((StatusCode::OK, Json(details)).into_response()),
        Err(e @ GetUploadError::NotFound(_)) => Err(AppError::NotFound(e.to_string())),
        Err(GetUploadError::Database(e)) => Err(AppError::Database(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uploads_routes_build() {
        let _router = uploads_routes();
    }
}
