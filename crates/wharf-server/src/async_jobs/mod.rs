//! Post-load maintenance jobs
//!
//! Requests such as "delete the rows of job run X" arrive over the API
//! after an upload has exported. They live in `wh_async_jobs`, one row per
//! table, and are executed by the [`AsyncJobRunner`] poll loop against the
//! destination's [`WarehouseLoader`](crate::loader::WarehouseLoader).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use wharf_common::WharfError;

pub mod runner;
pub mod types;

pub use runner::AsyncJobRunner;
pub use types::{
    AddJobResponse, AsyncJob, AsyncJobMetadata, AsyncJobStatus, StartJobRequest, StatusResponse,
};

/// Requests claimed per poll cycle
pub const MAX_BATCH_SIZE_TO_PROCESS: i64 = 10;

/// Attempts at resetting stale `executing` rows on startup
pub const MAX_CLEANUP_RETRIES: u32 = 5;

pub const MAX_ATTEMPTS_PER_JOB: i32 = 3;

pub const RETRY_TIME_INTERVAL: Duration = Duration::from_secs(10);

pub const ASYNC_JOB_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AsyncJobError {
    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("No exported tables for {source_id}/{destination_id}")]
    NoTables {
        source_id: String,
        destination_id: String,
    },

    #[error("Async job {0} not found")]
    NotFound(i64),

    #[error("No async jobs for job run {job_run_id} / task run {task_run_id}")]
    RunNotFound {
        job_run_id: String,
        task_run_id: String,
    },

    #[error("Async job store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Invalid job metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] WharfError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJobConfig {
    pub batch_size: i64,
    pub max_attempts: i32,
    pub timeout_secs: u64,
    pub retry_interval_secs: u64,
}

impl Default for AsyncJobConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE_TO_PROCESS,
            max_attempts: MAX_ATTEMPTS_PER_JOB,
            timeout_secs: ASYNC_JOB_TIMEOUT.as_secs(),
            retry_interval_secs: RETRY_TIME_INTERVAL.as_secs(),
        }
    }
}

impl AsyncJobConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// How long a claimed request may stay `executing` before another
    /// runner may reclaim it.
    pub fn lease(&self) -> Duration {
        self.timeout() * 2
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size < 1 {
            anyhow::bail!("ASYNC_JOB_BATCH_SIZE must be greater than 0");
        }
        if self.max_attempts < 1 {
            anyhow::bail!("ASYNC_JOB_MAX_ATTEMPTS must be at least 1");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("ASYNC_JOB_TIMEOUT_SECS must be greater than 0");
        }
        Ok(())
    }
}
