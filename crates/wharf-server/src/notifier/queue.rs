//! Postgres-backed job queue operations

use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::types::{Job, JobOutcome, JobResult, JobStatus, ReapSummary};
use super::{NotifierConfig, NotifierError, WAKEUP_CHANNEL};
use crate::db::with_retry;

const JOB_COLUMNS: &str = "id, batch_id, job_type, payload, output, status, attempt, owner, \
                           lease_expires_at, error, created_at, updated_at";

/// Handle on the `wh_jobs` table
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    config: NotifierConfig,
}

impl JobQueue {
    pub fn new(pool: PgPool, config: NotifierConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts one `waiting` job per payload under a fresh batch id.
    ///
    /// All rows are written in one transaction. Idle workers are woken once
    /// it commits.
    #[instrument(skip(self, payloads), fields(count = payloads.len()))]
    pub async fn publish<P: Serialize>(
        &self,
        job_type: &str,
        payloads: &[P],
    ) -> Result<Uuid, NotifierError> {
        if payloads.is_empty() {
            return Err(NotifierError::EmptyBatch);
        }

        let values = payloads
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let batch_id = Uuid::new_v4();

        with_retry("publish", || self.insert_batch(batch_id, job_type, &values))
            .await
            .map_err(NotifierError::Persistence)?;

        info!(%batch_id, job_type, count = values.len(), "Published job batch");
        Ok(batch_id)
    }

    async fn insert_batch(
        &self,
        batch_id: Uuid,
        job_type: &str,
        payloads: &[serde_json::Value],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO wh_jobs (batch_id, job_type, payload)
            SELECT $1, $2, payload FROM UNNEST($3::jsonb[]) WITH ORDINALITY AS t(payload, n)
            ORDER BY n
            "#,
        )
        .bind(batch_id)
        .bind(job_type)
        .bind(payloads)
        .execute(&mut *tx)
        .await?;

        // Delivered only if the transaction commits.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(WAKEUP_CHANNEL)
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Suspends until every job in the batch is terminal and returns one
    /// result per job, in publish order.
    ///
    /// Cancellation returns [`NotifierError::Cancelled`] immediately and
    /// leaves the jobs untouched.
    #[instrument(skip(self, cancel))]
    pub async fn await_batch(
        &self,
        batch_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobResult>, NotifierError> {
        loop {
            let (total, pending) = with_retry("batch_progress", || self.batch_progress(batch_id))
                .await?;

            if total == 0 {
                return Err(NotifierError::UnknownBatch(batch_id));
            }
            if pending == 0 {
                return self.batch_results(batch_id).await;
            }

            debug!(%batch_id, total, pending, "Batch still running");

            tokio::select! {
                _ = cancel.cancelled() => return Err(NotifierError::Cancelled(batch_id)),
                _ = tokio::time::sleep(self.config.poll_interval()) => {},
            }
        }
    }

    async fn batch_progress(&self, batch_id: Uuid) -> Result<(i64, i64), sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status IN ('waiting', 'executing'))
            FROM wh_jobs
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Current state of every job in a batch
    pub async fn batch_results(&self, batch_id: Uuid) -> Result<Vec<JobResult>, NotifierError> {
        let results =
            with_retry("batch_results", || self.fetch_batch_results(batch_id)).await?;
        Ok(results)
    }

    async fn fetch_batch_results(&self, batch_id: Uuid) -> Result<Vec<JobResult>, sqlx::Error> {
        sqlx::query_as::<_, JobResult>(
            r#"
            SELECT id AS job_id, status, attempt, payload, output, error
            FROM wh_jobs
            WHERE batch_id = $1
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Leases the oldest `waiting` job to `worker_id`.
    ///
    /// A single conditional update with `SKIP LOCKED` makes concurrent
    /// claimants receive distinct jobs.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, NotifierError> {
        let job = with_retry("claim", || self.try_claim(worker_id)).await?;

        if let Some(job) = &job {
            debug!(job_id = job.id, batch_id = %job.batch_id, worker_id, "Claimed job");
        }
        Ok(job)
    }

    async fn try_claim(&self, worker_id: &str) -> Result<Option<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE wh_jobs
            SET status = 'executing',
                owner = $1,
                lease_expires_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM wh_jobs
                WHERE status = 'waiting'
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Job>(&sql)
            .bind(worker_id)
            .bind(self.config.lease().as_secs_f64())
            .fetch_optional(&self.pool)
            .await
    }

    /// Moves a leased job to its terminal status and consumes one attempt.
    ///
    /// Returns [`NotifierError::NotOwner`] when `worker_id` no longer holds
    /// the lease; the caller must then discard its result.
    pub async fn complete(
        &self,
        job_id: i64,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<JobStatus, NotifierError> {
        let status = outcome.status();
        let (output, error) = match outcome {
            JobOutcome::Succeeded(output) => (Some(output), None),
            JobOutcome::Failed(error) => (None, Some(error)),
        };

        let result = sqlx::query(
            r#"
            UPDATE wh_jobs
            SET status = $3,
                output = $4,
                error = $5,
                attempt = attempt + 1,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND owner = $2 AND status = 'executing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(NotifierError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        debug!(job_id, worker_id, %status, "Completed job");
        Ok(status)
    }

    /// Extends the lease on a job the caller still owns.
    pub async fn renew_lease(&self, job_id: i64, worker_id: &str) -> Result<(), NotifierError> {
        let result = sqlx::query(
            r#"
            UPDATE wh_jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id = $1 AND owner = $2 AND status = 'executing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(self.config.lease().as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(NotifierError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Returns expired `executing` jobs to `waiting`, consuming one attempt,
    /// or aborts them once `max_attempts` is reached.
    pub async fn reap_expired(&self) -> Result<ReapSummary, NotifierError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE wh_jobs
            SET attempt = attempt + 1,
                status = CASE WHEN attempt + 1 >= $1 THEN 'aborted' ELSE 'waiting' END,
                error = CASE
                    WHEN attempt + 1 >= $1 THEN 'lease expired; attempts exhausted'
                    ELSE 'lease expired'
                END,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'executing' AND lease_expires_at < NOW()
            RETURNING id, status
            "#,
        )
        .bind(self.config.max_attempts)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReapSummary::default();
        for (job_id, status) in rows {
            if status == JobStatus::Aborted.as_str() {
                warn!(job_id, "Job lease expired with no attempts left, aborted");
                summary.aborted += 1;
            } else {
                summary.requeued += 1;
            }
        }
        Ok(summary)
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>, NotifierError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM wh_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
    }
}
