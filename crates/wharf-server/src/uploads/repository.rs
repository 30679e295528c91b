//! Persistence for `wh_uploads`, staging files and generated load files

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::load_files::LoadFileOutput;
use super::models::{StagingFile, StagingRange, Upload, UploadStage, UploadStatus, Warehouse};
use super::UploadError;
use crate::db::with_retry;
use crate::loader::LoadFileRef;

pub(crate) const UPLOAD_COLUMNS: &str = r#"
    id, source_id, destination_id, destination_type, namespace, status, error,
    last_error, error_stage, attempt, next_retry_time, start_staging_file_id,
    end_staging_file_id, staged_events, first_event_at, last_event_at,
    job_batch_id, created_at, updated_at, last_exec_at, duration_ms
"#;

/// Failed stage run, as written by [`UploadRepository::record_failure`]
#[derive(Debug, Clone)]
pub struct StageFailure<'a> {
    pub stage: UploadStage,
    pub message: &'a str,
    pub attempt: i32,
    /// `None` aborts the upload
    pub next_retry_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct UploadRepository {
    pool: PgPool,
}

impl UploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get(&self, upload_id: i64) -> Result<Option<Upload>, UploadError> {
        let upload = sqlx::query_as::<_, Upload>(&format!(
            "SELECT {} FROM wh_uploads WHERE id = $1",
            UPLOAD_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(upload)
    }

    /// The non-terminal upload of a pair, if any
    pub async fn find_active(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<Upload>, UploadError> {
        let upload = sqlx::query_as::<_, Upload>(&format!(
            r#"
            SELECT {} FROM wh_uploads
            WHERE source_id = $1 AND destination_id = $2
              AND status NOT IN ('exported_data', 'aborted')
            ORDER BY id DESC
            LIMIT 1
            "#,
            UPLOAD_COLUMNS
        ))
        .bind(source_id)
        .bind(destination_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(upload)
    }

    pub async fn get_warehouse(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<Warehouse>, UploadError> {
        let warehouse = sqlx::query_as::<_, Warehouse>(
            r#"
            SELECT source_id, destination_id, destination_type, namespace, enabled
            FROM wh_warehouses
            WHERE source_id = $1 AND destination_id = $2
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(warehouse)
    }

    /// Enabled warehouses with an unfinished upload or uncovered staging files
    pub async fn warehouses_with_pending_work(&self) -> Result<Vec<Warehouse>, UploadError> {
        let warehouses = with_retry("warehouses_with_pending_work", || {
            sqlx::query_as::<_, Warehouse>(
                r#"
                SELECT w.source_id, w.destination_id, w.destination_type, w.namespace, w.enabled
                FROM wh_warehouses w
                WHERE w.enabled
                  AND (
                    EXISTS (
                        SELECT 1 FROM wh_uploads u
                        WHERE u.source_id = w.source_id
                          AND u.destination_id = w.destination_id
                          AND u.status NOT IN ('exported_data', 'aborted')
                    )
                    OR EXISTS (
                        SELECT 1 FROM wh_staging_files s
                        WHERE s.source_id = w.source_id
                          AND s.destination_id = w.destination_id
                          AND s.id > COALESCE((
                              SELECT MAX(u.end_staging_file_id) FROM wh_uploads u
                              WHERE u.source_id = w.source_id
                                AND u.destination_id = w.destination_id
                          ), 0)
                    )
                  )
                ORDER BY w.source_id, w.destination_id
                "#,
            )
            .fetch_all(&self.pool)
        })
        .await?;
        Ok(warehouses)
    }

    /// Staging files after the last upload's range, up to `limit` files.
    pub async fn pending_staging_range(
        &self,
        source_id: &str,
        destination_id: &str,
        limit: i64,
    ) -> Result<Option<StagingRange>, UploadError> {
        let row: (
            Option<i64>,
            Option<i64>,
            i64,
            i64,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as(
            r#"
            WITH covered AS (
                SELECT COALESCE(MAX(end_staging_file_id), 0) AS end_id
                FROM wh_uploads
                WHERE source_id = $1 AND destination_id = $2
            ),
            batch AS (
                SELECT id, total_events, first_event_at, last_event_at
                FROM wh_staging_files
                WHERE source_id = $1 AND destination_id = $2
                  AND id > (SELECT end_id FROM covered)
                ORDER BY id
                LIMIT $3
            )
            SELECT MIN(id), MAX(id), COUNT(*),
                   COALESCE(SUM(total_events), 0)::BIGINT,
                   MIN(first_event_at), MAX(last_event_at)
            FROM batch
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;

        let (start_id, end_id, file_count, total_events, first_event_at, last_event_at) = row;
        Ok(match (start_id, end_id) {
            (Some(start_id), Some(end_id)) if file_count > 0 => Some(StagingRange {
                start_id,
                end_id,
                file_count,
                total_events,
                first_event_at,
                last_event_at,
            }),
            _ => None,
        })
    }

    /// Inserts a `waiting` upload covering `range`.
    #[instrument(skip(self, warehouse), fields(source_id = %warehouse.source_id, destination_id = %warehouse.destination_id))]
    pub async fn create(
        &self,
        warehouse: &Warehouse,
        range: &StagingRange,
    ) -> Result<Upload, UploadError> {
        let upload = sqlx::query_as::<_, Upload>(&format!(
            r#"
            INSERT INTO wh_uploads (
                source_id, destination_id, destination_type, namespace,
                start_staging_file_id, end_staging_file_id, staged_events,
                first_event_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        ))
        .bind(&warehouse.source_id)
        .bind(&warehouse.destination_id)
        .bind(&warehouse.destination_type)
        .bind(&warehouse.namespace)
        .bind(range.start_id)
        .bind(range.end_id)
        .bind(range.total_events)
        .bind(range.first_event_at)
        .bind(range.last_event_at)
        .fetch_one(&self.pool)
        .await?;

        debug!(upload_id = upload.id, files = range.file_count, "Created upload");
        Ok(upload)
    }

    /// Staging files in the upload's range, oldest first
    pub async fn staging_files(&self, upload: &Upload) -> Result<Vec<StagingFile>, UploadError> {
        let files = sqlx::query_as::<_, StagingFile>(
            r#"
            SELECT id, source_id, destination_id, location, total_events,
                   first_event_at, last_event_at, created_at
            FROM wh_staging_files
            WHERE source_id = $1 AND destination_id = $2
              AND id BETWEEN $3 AND $4
            ORDER BY id
            "#,
        )
        .bind(&upload.source_id)
        .bind(&upload.destination_id)
        .bind(upload.start_staging_file_id)
        .bind(upload.end_staging_file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Enters `generating_load_files` with the batch that produces the load files.
    pub async fn start_generation(&self, upload_id: i64, batch_id: Uuid) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE wh_uploads
            SET status = 'generating_load_files', job_batch_id = $2,
                next_retry_time = NULL, last_exec_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('exported_data', 'aborted')
            "#,
        )
        .bind(upload_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(upload_id, result.rows_affected())
    }

    /// Enters `exporting_data`.
    pub async fn start_export(&self, upload_id: i64) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE wh_uploads
            SET status = 'exporting_data', job_batch_id = NULL,
                next_retry_time = NULL, last_exec_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('exported_data', 'aborted')
            "#,
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(upload_id, result.rows_affected())
    }

    pub async fn mark_exported(&self, upload_id: i64) -> Result<(), UploadError> {
        let result = with_retry("mark_exported", || {
            sqlx::query(
                r#"
                UPDATE wh_uploads
                SET status = 'exported_data', next_retry_time = NULL, job_batch_id = NULL,
                    duration_ms = (EXTRACT(EPOCH FROM NOW() - created_at) * 1000)::BIGINT,
                    updated_at = NOW()
                WHERE id = $1 AND status NOT IN ('exported_data', 'aborted')
                "#,
            )
            .bind(upload_id)
            .execute(&self.pool)
        })
        .await?;
        ensure_updated(upload_id, result.rows_affected())
    }

    /// Records a failed stage run.
    ///
    /// The message is appended to `error["<stage>_failed"].errors`. Without a
    /// retry time the upload is aborted.
    pub async fn record_failure(
        &self,
        upload_id: i64,
        failure: &StageFailure<'_>,
    ) -> Result<UploadStatus, UploadError> {
        let status = match failure.next_retry_time {
            Some(_) => failure.stage.failed_status(),
            None => UploadStatus::Aborted,
        };
        let error_key = failure.stage.failed_status().as_str();

        let result = with_retry("record_failure", || {
            sqlx::query(
                r#"
                UPDATE wh_uploads
                SET status = $2,
                    attempt = $3::INT,
                    next_retry_time = $4,
                    last_error = $5::TEXT,
                    error_stage = $6,
                    error = jsonb_set(
                        error,
                        ARRAY[$7::TEXT],
                        jsonb_build_object(
                            'attempt', $3::INT,
                            'errors', COALESCE(error -> $7::TEXT -> 'errors', '[]'::jsonb)
                                || jsonb_build_array($5::TEXT)
                        )
                    ),
                    job_batch_id = NULL,
                    duration_ms = CASE
                        WHEN $2 = 'aborted'
                        THEN (EXTRACT(EPOCH FROM NOW() - created_at) * 1000)::BIGINT
                        ELSE duration_ms
                    END,
                    updated_at = NOW()
                WHERE id = $1 AND status NOT IN ('exported_data', 'aborted')
                "#,
            )
            .bind(upload_id)
            .bind(status.as_str())
            .bind(failure.attempt)
            .bind(failure.next_retry_time)
            .bind(failure.message)
            .bind(failure.stage.as_str())
            .bind(error_key)
            .execute(&self.pool)
        })
        .await?;

        ensure_updated(upload_id, result.rows_affected())?;
        Ok(status)
    }

    /// Stores the load files produced for an upload. Re-saving the same
    /// `(staging file, table)` replaces the earlier entry.
    pub async fn save_load_files(
        &self,
        upload_id: i64,
        outputs: &[LoadFileOutput],
    ) -> Result<usize, UploadError> {
        let mut staging_ids = Vec::new();
        let mut tables = Vec::new();
        let mut locations = Vec::new();
        let mut rows = Vec::new();
        for output in outputs {
            for file in &output.load_files {
                staging_ids.push(output.staging_file_id);
                tables.push(file.table_name.clone());
                locations.push(file.location.clone());
                rows.push(file.total_rows);
            }
        }
        if tables.is_empty() {
            return Ok(0);
        }

        sqlx::query(
            r#"
            INSERT INTO wh_load_files (upload_id, staging_file_id, table_name, location, total_rows)
            SELECT $1, * FROM UNNEST($2::BIGINT[], $3::TEXT[], $4::TEXT[], $5::BIGINT[])
            ON CONFLICT (upload_id, staging_file_id, table_name)
            DO UPDATE SET location = EXCLUDED.location, total_rows = EXCLUDED.total_rows
            "#,
        )
        .bind(upload_id)
        .bind(&staging_ids)
        .bind(&tables)
        .bind(&locations)
        .bind(&rows)
        .execute(&self.pool)
        .await?;

        Ok(tables.len())
    }

    pub async fn load_files_for_table(
        &self,
        upload_id: i64,
        table_name: &str,
    ) -> Result<Vec<LoadFileRef>, UploadError> {
        let files = sqlx::query_as::<_, LoadFileRef>(
            r#"
            SELECT location, total_rows
            FROM wh_load_files
            WHERE upload_id = $1 AND table_name = $2
            ORDER BY staging_file_id
            "#,
        )
        .bind(upload_id)
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }
}

fn ensure_updated(upload_id: i64, rows_affected: u64) -> Result<(), UploadError> {
    if rows_affected == 0 {
        Err(UploadError::Terminal(upload_id))
    } else {
        Ok(())
    }
}
