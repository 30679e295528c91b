//! Get upload query
//!
//! One upload with its per-table breakdown.

use chrono::{DateTime, Utc};
use mediator::Request;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::uploads::repository::UPLOAD_COLUMNS;
use crate::uploads::Upload;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUploadQuery {
    pub upload_id: i64,
}

/// Table breakdown entry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadTableItem {
    pub id: i64,
    pub upload_id: i64,
    pub name: String,
    pub status: String,
    pub error: Option<String>,
    pub last_exec_at: Option<DateTime<Utc>>,
    pub count: Option<i64>,
    /// Milliseconds
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDetails {
    #[serde(flatten)]
    pub upload: Upload,
    pub tables: Vec<UploadTableItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum GetUploadError {
    #[error("Upload {0} not found")]
    NotFound(i64),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Request<Result<UploadDetails, GetUploadError>> for GetUploadQuery {}

pub async fn handle(pool: PgPool, query: GetUploadQuery) -> Result<UploadDetails, GetUploadError> {
    let upload = sqlx::query_as::<_, Upload>(&format!(
        "SELECT {} FROM wh_uploads WHERE id = $1",
        UPLOAD_COLUMNS
    ))
    .bind(query.upload_id)
    .fetch_optional(&pool)
    .await?
    .ok_or(GetUploadError::NotFound(query.upload_id))?;

    let tables = sqlx::query_as::<_, UploadTableItem>(
        r#"
        SELECT id, upload_id, table_name AS name, status, error, last_exec_at,
               row_count AS count, duration_ms AS duration
        FROM wh_table_uploads
        WHERE upload_id = $1
        ORDER BY table_name
        "#,
    )
    .bind(query.upload_id)
    .fetch_all(&pool)
    .await?;

    Ok(UploadDetails { upload, tables })
}
