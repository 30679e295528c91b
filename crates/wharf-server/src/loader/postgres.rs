//! Reference loader for `POSTGRES` destinations
//!
//! Each event table is stored as `"<namespace>"."<table>" (id, data jsonb,
//! loaded_at)`. One table load is one transaction, so a failed load leaves
//! nothing behind and can be retried as a whole.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{sanitize_identifier, LoadFileRef, LoaderError, WarehouseLoader};
use crate::storage::FileManager;

/// Deletes rows left by earlier source job runs: rows tagged with a
/// different job and task run that were loaded before `start_time`.
pub const DELETE_BY_JOB_RUN_ID: &str = "deletebyjobrunid";

/// Deletes every row in the table.
pub const CLEAR_TABLE: &str = "cleartable";

#[derive(Debug, Deserialize)]
struct JobRunScope {
    job_run_id: String,
    task_run_id: String,
    start_time: DateTime<Utc>,
}

pub struct PostgresLoader {
    pool: PgPool,
    files: Arc<dyn FileManager>,
}

impl PostgresLoader {
    pub fn new(pool: PgPool, files: Arc<dyn FileManager>) -> Self {
        Self { pool, files }
    }

    /// Creates schema and table if missing.
    ///
    /// Runs under an advisory lock because concurrent `CREATE ... IF NOT
    /// EXISTS` on the same name can still fail with a unique violation.
    async fn ensure_table(&self, namespace: &str, table: &str) -> Result<(), LoaderError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("wharf-ddl:{}", namespace))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, namespace))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}"."{}" (
                id BIGSERIAL PRIMARY KEY,
                data JSONB NOT NULL,
                loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            namespace, table
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read_rows(&self, load_file: &LoadFileRef) -> Result<Vec<serde_json::Value>, LoaderError> {
        let bytes = self.files.download(&load_file.location).await?;
        let text = std::str::from_utf8(&bytes).map_err(|e| LoaderError::MalformedLoadFile {
            location: load_file.location.clone(),
            reason: e.to_string(),
        })?;

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| LoaderError::MalformedLoadFile {
                    location: load_file.location.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn table_exists(&self, namespace: &str, table: &str) -> Result<bool, LoaderError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(format!(r#""{}"."{}""#, namespace, table))
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl WarehouseLoader for PostgresLoader {
    #[instrument(skip(self, load_files), fields(files = load_files.len()))]
    async fn load_table(
        &self,
        namespace: &str,
        table: &str,
        load_files: &[LoadFileRef],
    ) -> Result<u64, LoaderError> {
        let namespace = sanitize_identifier(namespace)?;
        let table = sanitize_identifier(table)?;
        self.ensure_table(&namespace, &table).await?;

        let insert = format!(
            r#"INSERT INTO "{}"."{}" (data) SELECT d FROM UNNEST($1::jsonb[]) AS d"#,
            namespace, table
        );

        let mut tx = self.pool.begin().await?;
        let mut loaded = 0u64;
        for load_file in load_files {
            let rows = self.read_rows(load_file).await?;
            if rows.is_empty() {
                continue;
            }
            let result = sqlx::query(&insert).bind(&rows).execute(&mut *tx).await?;
            debug!(location = %load_file.location, rows = result.rows_affected(), "Copied load file");
            loaded += result.rows_affected();
        }
        tx.commit().await?;

        info!(%namespace, %table, rows = loaded, "Loaded table");
        Ok(loaded)
    }

    #[instrument(skip(self, metadata))]
    async fn run_maintenance(
        &self,
        job_type: &str,
        namespace: &str,
        table: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), LoaderError> {
        let namespace = sanitize_identifier(namespace)?;
        let table = sanitize_identifier(table)?;

        match job_type.to_lowercase().as_str() {
            DELETE_BY_JOB_RUN_ID => {
                let scope: JobRunScope = serde_json::from_value(metadata.clone())?;
                if !self.table_exists(&namespace, &table).await? {
                    return Ok(());
                }
                // Rows without a job run tag never match.
                let result = sqlx::query(&format!(
                    r#"
                    DELETE FROM "{}"."{}"
                    WHERE data #>> '{{context,sources,job_run_id}}' <> $1
                      AND data #>> '{{context,sources,task_run_id}}' <> $2
                      AND loaded_at < $3
                    "#,
                    namespace, table
                ))
                .bind(&scope.job_run_id)
                .bind(&scope.task_run_id)
                .bind(scope.start_time)
                .execute(&self.pool)
                .await?;
                info!(%namespace, %table, deleted = result.rows_affected(), "Deleted rows of earlier job runs");
                Ok(())
            },
            CLEAR_TABLE => {
                if self.table_exists(&namespace, &table).await? {
                    sqlx::query(&format!(r#"DELETE FROM "{}"."{}""#, namespace, table))
                        .execute(&self.pool)
                        .await?;
                }
                Ok(())
            },
            other => Err(LoaderError::UnsupportedJob(other.to_string())),
        }
    }
}
