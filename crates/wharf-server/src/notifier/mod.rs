//! Distributed job queue
//!
//! A coordinator publishes a batch of jobs into `wh_jobs` and waits for all of
//! them to reach a terminal status. Stateless workers (possibly in other
//! processes) claim jobs one at a time under a time-bounded lease, execute
//! them and report back. A reaper returns jobs whose lease expired to the
//! queue, or aborts them once their attempts are used up.
//!
//! `NOTIFY` on [`WAKEUP_CHANNEL`] only shortens worker idle time; workers
//! always fall back to polling.
//!
//! # Components
//!
//! - [`JobQueue`]: publish, await, claim, complete, renew, reap
//! - [`WorkerPool`]: claim loop with heartbeats
//! - [`Reaper`]: periodic lease expiry sweep

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use wharf_common::WharfError;

pub mod queue;
pub mod reaper;
pub mod types;
pub mod worker;

pub use queue::JobQueue;
pub use reaper::Reaper;
pub use types::{Job, JobOutcome, JobResult, JobStatus, ReapSummary};
pub use worker::WorkerPool;

/// Postgres channel used to wake idle workers after a publish.
pub const WAKEUP_CHANNEL: &str = "wh_jobs_wakeup";

/// Error recorded on a job a worker gave up on because of shutdown.
pub const SHUTDOWN_ERROR: &str = "worker shutting down before job completed";

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("Failed to persist job batch: {0}")]
    Persistence(#[source] sqlx::Error),

    #[error("Job store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Job {job_id} is not leased by {worker_id}")]
    NotOwner { job_id: i64, worker_id: String },

    #[error("Batch {0} has no jobs")]
    UnknownBatch(Uuid),

    #[error("Refusing to publish an empty batch")]
    EmptyBatch,

    #[error("Wait for batch {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] WharfError),
}

/// Queue, worker and reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotifierConfig {
    /// Concurrent worker tasks in this process
    pub workers: usize,
    /// Idle poll interval for workers and batch waiters
    pub poll_interval_ms: u64,
    /// Lease granted on claim and on every heartbeat
    pub lease_secs: u64,
    /// Attempts before a job whose lease keeps expiring is aborted
    pub max_attempts: i32,
    pub reaper_interval_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1_000,
            lease_secs: 120,
            max_attempts: 3,
            reaper_interval_secs: 30,
        }
    }
}

impl NotifierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Heartbeats renew the lease three times per lease period.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease() / 3).max(Duration::from_millis(100))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("NOTIFIER_POLL_INTERVAL_MS must be greater than 0");
        }
        if self.lease_secs == 0 {
            anyhow::bail!("NOTIFIER_LEASE_SECS must be greater than 0");
        }
        if self.max_attempts < 1 {
            anyhow::bail!("NOTIFIER_MAX_ATTEMPTS must be at least 1");
        }
        if self.reaper_interval_secs == 0 {
            anyhow::bail!("NOTIFIER_REAPER_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }
}
