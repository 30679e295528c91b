//! Upload, table upload and warehouse rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wharf_common::WharfError;

/// The two stages an upload can fail in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    GeneratingLoadFiles,
    ExportingData,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStage::GeneratingLoadFiles => "generating_load_files",
            UploadStage::ExportingData => "exporting_data",
        }
    }

    /// Status an upload takes after a failed run of this stage
    pub fn failed_status(self) -> UploadStatus {
        UploadStatus::Failed(self)
    }
}

impl std::fmt::Display for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UploadStatus {
    Waiting,
    GeneratingLoadFiles,
    ExportingData,
    ExportedData,
    Aborted,
    Failed(UploadStage),
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Waiting => "waiting",
            UploadStatus::GeneratingLoadFiles => "generating_load_files",
            UploadStatus::ExportingData => "exporting_data",
            UploadStatus::ExportedData => "exported_data",
            UploadStatus::Aborted => "aborted",
            UploadStatus::Failed(UploadStage::GeneratingLoadFiles) => {
                "generating_load_files_failed"
            },
            UploadStatus::Failed(UploadStage::ExportingData) => "exporting_data_failed",
        }
    }

    /// `exported_data` and `aborted` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::ExportedData | UploadStatus::Aborted)
    }
}

impl TryFrom<String> for UploadStatus {
    type Error = WharfError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "waiting" => Ok(UploadStatus::Waiting),
            "generating_load_files" => Ok(UploadStatus::GeneratingLoadFiles),
            "generating_load_files_failed" => {
                Ok(UploadStatus::Failed(UploadStage::GeneratingLoadFiles))
            },
            "exporting_data" => Ok(UploadStatus::ExportingData),
            "exporting_data_failed" => Ok(UploadStatus::Failed(UploadStage::ExportingData)),
            "exported_data" => Ok(UploadStatus::ExportedData),
            "aborted" => Ok(UploadStatus::Aborted),
            _ => Err(WharfError::invalid_status("upload", s)),
        }
    }
}

impl From<UploadStatus> for String {
    fn from(status: UploadStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table load state within one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableUploadStatus {
    Waiting,
    Executing,
    ExportingData,
    ExportedData,
    Failed,
}

impl TableUploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableUploadStatus::Waiting => "waiting",
            TableUploadStatus::Executing => "executing",
            TableUploadStatus::ExportingData => "exporting_data",
            TableUploadStatus::ExportedData => "exported_data",
            TableUploadStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for TableUploadStatus {
    type Error = WharfError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "waiting" => Ok(TableUploadStatus::Waiting),
            "executing" => Ok(TableUploadStatus::Executing),
            "exporting_data" => Ok(TableUploadStatus::ExportingData),
            "exported_data" => Ok(TableUploadStatus::ExportedData),
            "failed" => Ok(TableUploadStatus::Failed),
            _ => Err(WharfError::invalid_status("table upload", s)),
        }
    }
}

impl std::fmt::Display for TableUploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `wh_uploads`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Upload {
    pub id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub namespace: String,
    #[sqlx(try_from = "String")]
    pub status: UploadStatus,
    /// Failure history keyed by failed status
    pub error: serde_json::Value,
    pub last_error: Option<String>,
    pub error_stage: Option<String>,
    pub attempt: i32,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub staged_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub job_batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_exec_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Upload {
    /// Whether a retry wait is still pending at `now`
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time.is_some_and(|at| at > now)
    }
}

/// A row of `wh_table_uploads`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TableUpload {
    pub id: i64,
    pub upload_id: i64,
    pub table_name: String,
    #[sqlx(try_from = "String")]
    pub status: TableUploadStatus,
    pub error: Option<String>,
    pub row_count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub last_exec_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A configured `(source, destination)` pair
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Warehouse {
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub namespace: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagingFile {
    pub id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub location: String,
    pub total_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Contiguous run of staging files not yet covered by any upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRange {
    pub start_id: i64,
    pub end_id: i64,
    pub file_count: i64,
    pub total_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}
