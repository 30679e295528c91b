//! Async job runner
//!
//! Claims a batch of `waiting`/`failed` requests per cycle with a single
//! conditional update, runs them concurrently under a timeout and records
//! the outcome. A request that fails `max_attempts` times is aborted.
//!
//! A claim stamps the runner's identity and a lease of twice the job
//! timeout. Only the owner may record an outcome, and a request whose lease
//! has run out is returned to `waiting` at the start of every cycle.

use futures::future::join_all;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::types::{
    aggregate_status, AddJobResponse, AsyncJob, AsyncJobStatus, StartJobRequest, StatusResponse,
};
use super::{AsyncJobConfig, AsyncJobError, MAX_CLEANUP_RETRIES};
use crate::loader::LoaderRegistry;

const ASYNC_JOB_COLUMNS: &str = r#"
    id, source_id, destination_id, table_name, job_type, metadata, status,
    attempt, error, created_at, updated_at
"#;

#[derive(Clone)]
pub struct AsyncJobRunner {
    pool: PgPool,
    loaders: LoaderRegistry,
    config: AsyncJobConfig,
    identity: String,
}

impl AsyncJobRunner {
    pub fn new(pool: PgPool, loaders: LoaderRegistry, config: AsyncJobConfig) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let identity = format!(
            "{}-{}-{}",
            host,
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        Self {
            pool,
            loaders,
            config,
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &AsyncJobConfig {
        &self.config
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(info_span!("async_job_runner")))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.retry_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            match self.run_cycle().await {
                Ok(0) => {},
                Ok(processed) => debug!(processed, "Async job cycle finished"),
                Err(e) => error!(error = %e, "Async job cycle failed"),
            }
        }

        info!("Async job runner stopped");
    }

    /// Requests whose lease has run out go back to `waiting`. Requests
    /// still leased by a live runner are left alone.
    pub async fn reset_stale(&self) -> Result<u64, AsyncJobError> {
        let mut attempt = 0;
        loop {
            let result = sqlx::query(
                r#"
                UPDATE wh_async_jobs
                SET status = 'waiting', owner = NULL, lease_expires_at = NULL, updated_at = NOW()
                WHERE status = 'executing'
                  AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
                "#,
            )
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => {
                    if done.rows_affected() > 0 {
                        info!(reset = done.rows_affected(), "Reset stale async jobs");
                    }
                    return Ok(done.rows_affected());
                },
                Err(e) if attempt + 1 < MAX_CLEANUP_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Resetting stale async jobs failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(attempt as u64)).await;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reclaims expired leases, then claims and executes one batch.
    /// Returns how many requests ran.
    pub async fn run_cycle(&self) -> Result<usize, AsyncJobError> {
        if let Err(e) = self.reset_stale().await {
            warn!(error = %e, "Could not reclaim expired async job leases");
        }

        let jobs = self.claim_batch().await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let count = jobs.len();
        let outcomes = join_all(jobs.iter().map(|job| self.execute(job))).await;
        for (job, outcome) in jobs.iter().zip(outcomes) {
            // Unrecorded requests are reclaimed once their lease runs out.
            if let Err(e) = self.record_outcome(job, outcome).await {
                error!(job_id = job.id, error = %e, "Could not record async job outcome");
            }
        }

        Ok(count)
    }

    async fn claim_batch(&self) -> Result<Vec<AsyncJob>, AsyncJobError> {
        let jobs = sqlx::query_as::<_, AsyncJob>(&format!(
            r#"
            UPDATE wh_async_jobs
            SET status = 'executing',
                owner = $3,
                lease_expires_at = NOW() + make_interval(secs => $4),
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM wh_async_jobs
                WHERE status IN ('waiting', 'failed') AND attempt < $1
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            ASYNC_JOB_COLUMNS
        ))
        .bind(self.config.max_attempts)
        .bind(self.config.batch_size)
        .bind(&self.identity)
        .bind(self.config.lease().as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(job_id = job.id, job_type = %job.job_type, table = %job.table_name))]
    async fn execute(&self, job: &AsyncJob) -> Result<(), String> {
        let namespace_and_type: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT namespace, destination_type FROM wh_warehouses
            WHERE source_id = $1 AND destination_id = $2
            "#,
        )
        .bind(&job.source_id)
        .bind(&job.destination_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let Some((namespace, destination_type)) = namespace_and_type else {
            return Err(format!(
                "warehouse {}/{} is not configured",
                job.source_id, job.destination_id
            ));
        };

        let loader = self.loaders.get(&destination_type).map_err(|e| e.to_string())?;

        match tokio::time::timeout(
            self.config.timeout(),
            loader.run_maintenance(&job.job_type, &namespace, &job.table_name, &job.metadata),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.config.timeout().as_secs()
            )),
        }
    }

    async fn record_outcome(
        &self,
        job: &AsyncJob,
        outcome: Result<(), String>,
    ) -> Result<(), AsyncJobError> {
        match outcome {
            Ok(()) => {
                let done = sqlx::query(
                    r#"
                    UPDATE wh_async_jobs
                    SET status = 'succeeded', attempt = attempt + 1, error = NULL,
                        owner = NULL, lease_expires_at = NULL, updated_at = NOW()
                    WHERE id = $1 AND status = 'executing' AND owner = $2
                    "#,
                )
                .bind(job.id)
                .bind(&self.identity)
                .execute(&self.pool)
                .await?;
                if done.rows_affected() == 0 {
                    warn!(job_id = job.id, "Async job lease was lost before completion");
                } else {
                    info!(job_id = job.id, table = %job.table_name, "Async job succeeded");
                }
            },
            Err(error) => {
                let status: Option<String> = sqlx::query_scalar(
                    r#"
                    UPDATE wh_async_jobs
                    SET attempt = attempt + 1,
                        status = CASE WHEN attempt + 1 >= $2 THEN 'aborted' ELSE 'failed' END,
                        error = $3,
                        owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'executing' AND owner = $4
                    RETURNING status
                    "#,
                )
                .bind(job.id)
                .bind(self.config.max_attempts)
                .bind(&error)
                .bind(&self.identity)
                .fetch_optional(&self.pool)
                .await?;
                warn!(
                    job_id = job.id,
                    table = %job.table_name,
                    status = status.as_deref().unwrap_or("lease lost"),
                    error = %error,
                    "Async job failed"
                );
            },
        }
        Ok(())
    }

    /// Queues one request per table of the pair's latest exported upload.
    #[instrument(skip(self, request), fields(source_id = %request.source_id, destination_id = %request.destination_id))]
    pub async fn enqueue(&self, request: &StartJobRequest) -> Result<AddJobResponse, AsyncJobError> {
        let metadata = request.metadata()?;

        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT t.table_name FROM wh_table_uploads t
            WHERE t.upload_id = (
                SELECT id FROM wh_uploads
                WHERE source_id = $1 AND destination_id = $2 AND status = 'exported_data'
                ORDER BY id DESC
                LIMIT 1
            )
            ORDER BY t.table_name
            "#,
        )
        .bind(&request.source_id)
        .bind(&request.destination_id)
        .fetch_all(&self.pool)
        .await?;

        if tables.is_empty() {
            return Err(AsyncJobError::NoTables {
                source_id: request.source_id.clone(),
                destination_id: request.destination_id.clone(),
            });
        }

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO wh_async_jobs (source_id, destination_id, table_name, job_type, metadata)
            SELECT $1, $2, t, $3, $4 FROM UNNEST($5::TEXT[]) AS t
            RETURNING id
            "#,
        )
        .bind(&request.source_id)
        .bind(&request.destination_id)
        .bind(&metadata.jobtype)
        .bind(serde_json::to_value(&metadata)?)
        .bind(&tables)
        .fetch_all(&self.pool)
        .await?;

        info!(jobs = ids.len(), job_type = %metadata.jobtype, "Queued async jobs");
        Ok(AddJobResponse {
            jobids: ids,
            error: None,
        })
    }

    pub async fn get(&self, job_id: i64) -> Result<AsyncJob, AsyncJobError> {
        sqlx::query_as::<_, AsyncJob>(&format!(
            "SELECT {} FROM wh_async_jobs WHERE id = $1",
            ASYNC_JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AsyncJobError::NotFound(job_id))
    }

    pub async fn get_status(&self, job_id: i64) -> Result<StatusResponse, AsyncJobError> {
        let job = self.get(job_id).await?;
        Ok(StatusResponse {
            status: job.status.as_str().to_string(),
            error: job.error,
        })
    }

    /// Combined status of every request created for one job/task run.
    pub async fn get_status_by_run(
        &self,
        source_id: &str,
        destination_id: &str,
        job_run_id: &str,
        task_run_id: &str,
    ) -> Result<StatusResponse, AsyncJobError> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT status, error FROM wh_async_jobs
            WHERE source_id = $1 AND destination_id = $2
              AND metadata ->> 'job_run_id' = $3
              AND metadata ->> 'task_run_id' = $4
            ORDER BY id
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(job_run_id)
        .bind(task_run_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(AsyncJobError::RunNotFound {
                job_run_id: job_run_id.to_string(),
                task_run_id: task_run_id.to_string(),
            });
        }

        let statuses = rows
            .into_iter()
            .map(|(status, error)| -> Result<_, AsyncJobError> {
                Ok((AsyncJobStatus::try_from(status)?, error))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(aggregate_status(&statuses))
    }
}
