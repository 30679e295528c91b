//! Table upload tracker
//!
//! Every write first takes a share lock on the parent upload row and refuses
//! to touch tables of an upload that is already `exported_data` or
//! `aborted`.

use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::models::{TableUpload, TableUploadStatus, UploadStatus};
use super::UploadError;

const TABLE_UPLOAD_COLUMNS: &str = r#"
    id, upload_id, table_name, status, error, row_count, duration_ms,
    last_exec_at, created_at, updated_at
"#;

#[derive(Clone)]
pub struct TableUploadTracker {
    pool: PgPool,
}

impl TableUploadTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Adds a `waiting` entry per table. Existing entries are kept as they are.
    pub async fn create(&self, upload_id: i64, tables: &[String]) -> Result<(), UploadError> {
        let mut tx = self.pool.begin().await?;
        guard_upload(&mut tx, upload_id).await?;

        sqlx::query(
            r#"
            INSERT INTO wh_table_uploads (upload_id, table_name)
            SELECT $1, t FROM UNNEST($2::TEXT[]) AS t
            ON CONFLICT (upload_id, table_name) DO NOTHING
            "#,
        )
        .bind(upload_id)
        .bind(tables)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(upload_id, tables = tables.len(), "Table uploads created");
        Ok(())
    }

    /// Moves one table to `status`.
    ///
    /// Entering `exporting_data` stamps `last_exec_at`; reaching
    /// `exported_data` or `failed` records the time since then. `error` is
    /// stored for `failed` and cleared on `exported_data`.
    pub async fn set_status(
        &self,
        upload_id: i64,
        table_name: &str,
        status: TableUploadStatus,
        error: Option<&str>,
    ) -> Result<(), UploadError> {
        let mut tx = self.pool.begin().await?;
        guard_upload(&mut tx, upload_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE wh_table_uploads
            SET status = $3,
                error = CASE
                    WHEN $3 = 'failed' THEN $4
                    WHEN $3 = 'exported_data' THEN NULL
                    ELSE error
                END,
                last_exec_at = CASE WHEN $3 = 'exporting_data' THEN NOW() ELSE last_exec_at END,
                duration_ms = CASE
                    WHEN $3 IN ('exported_data', 'failed') AND last_exec_at IS NOT NULL
                    THEN (EXTRACT(EPOCH FROM NOW() - last_exec_at) * 1000)::BIGINT
                    ELSE duration_ms
                END,
                updated_at = NOW()
            WHERE upload_id = $1 AND table_name = $2
            "#,
        )
        .bind(upload_id)
        .bind(table_name)
        .bind(status.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::UnknownTable {
                upload_id,
                table_name: table_name.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// Moves every table currently in one of `from` to `to`; returns how many moved.
    pub async fn set_status_many(
        &self,
        upload_id: i64,
        from: &[TableUploadStatus],
        to: TableUploadStatus,
    ) -> Result<u64, UploadError> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();

        let mut tx = self.pool.begin().await?;
        guard_upload(&mut tx, upload_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE wh_table_uploads
            SET status = $3, updated_at = NOW()
            WHERE upload_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(upload_id)
        .bind(&from)
        .bind(to.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn record_count(
        &self,
        upload_id: i64,
        table_name: &str,
        row_count: i64,
    ) -> Result<(), UploadError> {
        let mut tx = self.pool.begin().await?;
        guard_upload(&mut tx, upload_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE wh_table_uploads SET row_count = $3, updated_at = NOW()
            WHERE upload_id = $1 AND table_name = $2
            "#,
        )
        .bind(upload_id)
        .bind(table_name)
        .bind(row_count)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::UnknownTable {
                upload_id,
                table_name: table_name.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_by_upload(&self, upload_id: i64) -> Result<Vec<TableUpload>, UploadError> {
        let tables = sqlx::query_as::<_, TableUpload>(&format!(
            "SELECT {} FROM wh_table_uploads WHERE upload_id = $1 ORDER BY table_name",
            TABLE_UPLOAD_COLUMNS
        ))
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }
}

async fn guard_upload(tx: &mut Transaction<'_, Postgres>, upload_id: i64) -> Result<(), UploadError> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM wh_uploads WHERE id = $1 FOR SHARE")
            .bind(upload_id)
            .fetch_optional(&mut **tx)
            .await?;

    match status {
        None => Err(UploadError::NotFound(upload_id)),
        Some(status) if UploadStatus::try_from(status.clone())?.is_terminal() => {
            Err(UploadError::Terminal(upload_id))
        },
        Some(_) => Ok(()),
    }
}
