use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wharf_common::WharfError;

use super::AsyncJobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncJobStatus {
    Waiting,
    Executing,
    Succeeded,
    Aborted,
    /// Failed an attempt; picked up again on a later cycle
    Failed,
}

impl AsyncJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncJobStatus::Waiting => "waiting",
            AsyncJobStatus::Executing => "executing",
            AsyncJobStatus::Succeeded => "succeeded",
            AsyncJobStatus::Aborted => "aborted",
            AsyncJobStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for AsyncJobStatus {
    type Error = WharfError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "waiting" => Ok(AsyncJobStatus::Waiting),
            "executing" => Ok(AsyncJobStatus::Executing),
            "succeeded" => Ok(AsyncJobStatus::Succeeded),
            "aborted" => Ok(AsyncJobStatus::Aborted),
            "failed" => Ok(AsyncJobStatus::Failed),
            _ => Err(WharfError::invalid_status("async job", s)),
        }
    }
}

impl std::fmt::Display for AsyncJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `wh_async_jobs`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AsyncJob {
    pub id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub table_name: String,
    pub job_type: String,
    pub metadata: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub status: AsyncJobStatus,
    pub attempt: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /api/v1/warehouse/jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub source_id: String,
    #[serde(rename = "type", default)]
    pub job_kind: String,
    #[serde(default)]
    pub channel: String,
    pub destination_id: String,
    pub start_time: String,
    pub job_run_id: String,
    pub task_run_id: String,
    pub async_job_type: String,
}

impl StartJobRequest {
    /// Checks required fields and builds the per-table metadata.
    pub fn metadata(&self) -> Result<AsyncJobMetadata, AsyncJobError> {
        for (name, value) in [
            ("source_id", &self.source_id),
            ("destination_id", &self.destination_id),
            ("job_run_id", &self.job_run_id),
            ("task_run_id", &self.task_run_id),
            ("async_job_type", &self.async_job_type),
        ] {
            if value.trim().is_empty() {
                return Err(AsyncJobError::InvalidRequest(format!("{} is required", name)));
            }
        }

        let start_time = DateTime::parse_from_rfc3339(&self.start_time)
            .map_err(|e| {
                AsyncJobError::InvalidRequest(format!(
                    "start_time '{}' is not RFC 3339: {}",
                    self.start_time, e
                ))
            })?
            .with_timezone(&Utc);

        Ok(AsyncJobMetadata {
            job_run_id: self.job_run_id.clone(),
            task_run_id: self.task_run_id.clone(),
            start_time,
            jobtype: self.async_job_type.to_lowercase(),
        })
    }
}

/// Stored in `wh_async_jobs.metadata` and handed to the loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncJobMetadata {
    pub job_run_id: String,
    pub task_run_id: String,
    pub start_time: DateTime<Utc>,
    pub jobtype: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddJobResponse {
    pub jobids: Vec<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub error: Option<String>,
}

/// Folds the requests of one job run into a single status.
///
/// Any aborted request makes the run aborted. The run succeeds only when
/// every request has; otherwise it is reported as executing, failed or
/// waiting, in that order of precedence.
pub fn aggregate_status(jobs: &[(AsyncJobStatus, Option<String>)]) -> StatusResponse {
    let errors = |wanted: AsyncJobStatus| -> Option<String> {
        let collected: Vec<&str> = jobs
            .iter()
            .filter(|(status, _)| *status == wanted)
            .filter_map(|(_, error)| error.as_deref())
            .collect();
        (!collected.is_empty()).then(|| collected.join("; "))
    };
    let any = |wanted: AsyncJobStatus| jobs.iter().any(|(status, _)| *status == wanted);

    let (status, error) = if any(AsyncJobStatus::Aborted) {
        (AsyncJobStatus::Aborted, errors(AsyncJobStatus::Aborted))
    } else if jobs.iter().all(|(status, _)| *status == AsyncJobStatus::Succeeded) {
        (AsyncJobStatus::Succeeded, None)
    } else if any(AsyncJobStatus::Executing) {
        (AsyncJobStatus::Executing, None)
    } else if any(AsyncJobStatus::Failed) {
        (AsyncJobStatus::Failed, errors(AsyncJobStatus::Failed))
    } else {
        (AsyncJobStatus::Waiting, None)
    };

    StatusResponse {
        status: status.as_str().to_string(),
        error,
    }
}
