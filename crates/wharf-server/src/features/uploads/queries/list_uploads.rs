//! List uploads query
//!
//! Filters by source, destination, destination type and status; newest first.

use mediator::Request;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::features::shared::{LimitOffset, PaginationMetadata};
use crate::uploads::repository::UPLOAD_COLUMNS;
use crate::uploads::{Upload, UploadStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListUploadsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<String>,
    /// Upload status such as `exporting_data_failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUploadsResponse {
    pub uploads: Vec<Upload>,
    pub pagination: PaginationMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum ListUploadsError {
    #[error("Unknown upload status '{0}'")]
    InvalidStatus(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Request<Result<ListUploadsResponse, ListUploadsError>> for ListUploadsQuery {}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &ListUploadsQuery) {
    builder.push(" WHERE 1=1");
    if let Some(source_id) = &query.source_id {
        builder.push(" AND source_id = ").push_bind(source_id.clone());
    }
    if let Some(destination_id) = &query.destination_id {
        builder
            .push(" AND destination_id = ")
            .push_bind(destination_id.clone());
    }
    if let Some(destination_type) = &query.destination_type {
        builder
            .push(" AND UPPER(destination_type) = UPPER(")
            .push_bind(destination_type.clone())
            .push(")");
    }
    if let Some(status) = &query.status {
        builder.push(" AND status = ").push_bind(status.clone());
    }
}

pub async fn handle(
    pool: PgPool,
    query: ListUploadsQuery,
) -> Result<ListUploadsResponse, ListUploadsError> {
    if let Some(status) = &query.status {
        UploadStatus::try_from(status.clone())
            .map_err(|_| ListUploadsError::InvalidStatus(status.clone()))?;
    }
    let window = LimitOffset::new(query.limit, query.offset);

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM wh_uploads");
    push_filters(&mut count, &query);
    let total: i64 = count.build_query_scalar().fetch_one(&pool).await?;

    let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM wh_uploads", UPLOAD_COLUMNS));
    push_filters(&mut select, &query);
    select
        .push(" ORDER BY id DESC LIMIT ")
        .push_bind(window.limit())
        .push(" OFFSET ")
        .push_bind(window.offset());
    let uploads = select.build_query_as::<Upload>().fetch_all(&pool).await?;

    Ok(ListUploadsResponse {
        uploads,
        pagination: window.metadata(total),
    })
}
