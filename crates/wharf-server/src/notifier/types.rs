//! Job queue rows and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wharf_common::WharfError;

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Executing,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Executing => "executing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Aborted)
    }
}

impl TryFrom<String> for JobStatus {
    type Error = WharfError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "executing" => Ok(JobStatus::Executing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            _ => Err(WharfError::invalid_status("job", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queue row (maps to `wh_jobs`)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub batch_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub output: Option<serde_json::Value>,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub attempt: i32,
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal view of one job, as returned by `await_batch`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobResult {
    pub job_id: i64,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub attempt: i32,
    pub payload: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// What a worker reports when it finishes a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded(_) => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Counts from one reaper sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub requeued: usize,
    pub aborted: usize,
}
