//! Upload orchestration
//!
//! An upload moves one batch of staging files of a `(source, destination)`
//! pair into the warehouse:
//!
//! ```text
//! waiting -> generating_load_files -> exporting_data -> exported_data
//!                  |                        |
//!                  v                        v
//!   generating_load_files_failed   exporting_data_failed   (retry with backoff)
//!                  \________________________/
//!                              |
//!                           aborted            (attempts exhausted)
//! ```
//!
//! The [`UploadScheduler`] decides which pairs get an upload and holds the
//! per-pair lock; the [`UploadOrchestrator`] drives one upload through the
//! stages; the [`TableUploadTracker`] records per-table progress.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use wharf_common::{Backoff, WharfError};

use crate::loader::LoaderError;
use crate::notifier::NotifierError;

pub mod load_files;
pub mod lock;
pub mod models;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod stats;
pub mod tracker;

pub use load_files::{LoadFileGenerator, LoadFileJob, LOAD_FILES_JOB};
pub use lock::{LockToken, UploadLocks};
pub use models::{TableUpload, TableUploadStatus, Upload, UploadStage, UploadStatus, Warehouse};
pub use orchestrator::{RunOutcome, UploadOrchestrator};
pub use repository::UploadRepository;
pub use scheduler::UploadScheduler;
pub use stats::UploadStats;
pub use tracker::TableUploadTracker;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload {0} not found")]
    NotFound(i64),

    #[error("Upload {0} is already finished")]
    Terminal(i64),

    #[error("Upload {upload_id} has no table '{table_name}'")]
    UnknownTable { upload_id: i64, table_name: String },

    #[error("Upload lock for {source_id}/{destination_id} was lost")]
    LeaseLost {
        source_id: String,
        destination_id: String,
    },

    #[error("Upload run cancelled")]
    Cancelled,

    #[error("Upload store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Notifier(#[from] NotifierError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Decode(#[from] WharfError),
}

/// Upload scheduling and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Failed stage runs allowed before an upload is aborted
    pub max_attempts: i32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    /// Uploads running at once in this process
    pub max_parallel_uploads: usize,
    /// Table loads running at once within one upload
    pub max_parallel_loads: usize,
    pub scheduler_interval_secs: u64,
    /// Staging files picked up by one new upload
    pub staging_files_batch_size: i64,
    pub lock_lease_secs: u64,
    /// Object key prefix for generated load files
    pub load_file_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_secs: 60,
            retry_cap_secs: 3600,
            max_parallel_uploads: 8,
            max_parallel_loads: 4,
            scheduler_interval_secs: 30,
            staging_files_batch_size: 960,
            lock_lease_secs: 300,
            load_file_prefix: "wharf-load-objects".to_string(),
        }
    }
}

impl UploadConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.retry_base_secs),
            Duration::from_secs(self.retry_cap_secs),
        )
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.max(1))
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// Lock renewal period, a third of the lease
    pub fn lock_heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.lock_lease_secs * 1000 / 3).max(100))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts < 1 {
            anyhow::bail!("UPLOAD_MAX_ATTEMPTS must be at least 1");
        }
        if self.max_parallel_uploads == 0 {
            anyhow::bail!("UPLOAD_MAX_PARALLEL must be greater than 0");
        }
        if self.max_parallel_loads == 0 {
            anyhow::bail!("UPLOAD_MAX_PARALLEL_LOADS must be greater than 0");
        }
        if self.staging_files_batch_size < 1 {
            anyhow::bail!("UPLOAD_STAGING_FILES_BATCH_SIZE must be greater than 0");
        }
        if self.lock_lease_secs == 0 {
            anyhow::bail!("UPLOAD_LOCK_LEASE_SECS must be greater than 0");
        }
        if self.load_file_prefix.trim_matches('/').is_empty() {
            anyhow::bail!("UPLOAD_LOAD_FILE_PREFIX cannot be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(UploadConfig::default().validate().is_ok());
    }

    #[test]
    fn test_backoff_uses_configured_bounds() {
        let config = UploadConfig {
            retry_base_secs: 10,
            retry_cap_secs: 25,
            ..Default::default()
        };
        let backoff = config.backoff();
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert_eq!(backoff.delay(3), Duration::from_secs(25));
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let config = UploadConfig {
            max_parallel_loads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_is_shorter_than_lease() {
        let config = UploadConfig::default();
        assert!(config.lock_heartbeat_interval() < config.lock_lease());
    }
}
