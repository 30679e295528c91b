//! Upload orchestrator
//!
//! Drives one upload from its current status until it is exported, waiting
//! for a retry, or aborted. All progress is persisted on the upload row, so
//! a run can stop at any await and a later run resumes from the stored
//! status.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::load_files::{LoadFileJob, LoadFileOutput, LOAD_FILES_JOB};
use super::models::{TableUploadStatus, Upload, UploadStage, UploadStatus};
use super::repository::{StageFailure, UploadRepository};
use super::stats::UploadStats;
use super::tracker::TableUploadTracker;
use super::{UploadConfig, UploadError};
use crate::loader::{LoaderRegistry, WarehouseLoader};
use crate::notifier::{JobQueue, NotifierError};

/// How a single orchestrator run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exported,
    /// A stage failed and the upload waits for `next_retry_time`
    Retrying {
        stage: UploadStage,
        next_retry_time: DateTime<Utc>,
    },
    Aborted,
    /// The upload was already exported or aborted; nothing changed
    AlreadyTerminal,
    /// Stopped by shutdown; status left as it was
    Cancelled,
}

/// Result of running one stage to completion
enum StageResult {
    Done,
    Failed(String),
}

enum TableLoad {
    Loaded(u64),
    Failed { table: String, error: String },
    Skipped,
}

pub struct UploadOrchestrator {
    uploads: UploadRepository,
    tracker: TableUploadTracker,
    queue: JobQueue,
    loaders: LoaderRegistry,
    config: UploadConfig,
}

impl UploadOrchestrator {
    pub fn new(
        uploads: UploadRepository,
        tracker: TableUploadTracker,
        queue: JobQueue,
        loaders: LoaderRegistry,
        config: UploadConfig,
    ) -> Self {
        Self {
            uploads,
            tracker,
            queue,
            loaders,
            config,
        }
    }

    /// Runs `upload_id` until it finishes, fails a stage, or `cancel` fires.
    pub async fn run(
        &self,
        upload_id: i64,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, UploadError> {
        let upload = self
            .uploads
            .get(upload_id)
            .await?
            .ok_or(UploadError::NotFound(upload_id))?;

        if upload.status.is_terminal() {
            info!(upload_id, status = %upload.status, "Upload already finished");
            return Ok(RunOutcome::AlreadyTerminal);
        }

        let span = info_span!(
            "upload",
            upload_id,
            source_id = %upload.source_id,
            destination_id = %upload.destination_id,
            destination_type = %upload.destination_type,
        );

        match self.drive(upload, cancel).instrument(span).await {
            Err(UploadError::Cancelled) => {
                info!(upload_id, "Upload run cancelled");
                Ok(RunOutcome::Cancelled)
            },
            other => other,
        }
    }

    async fn drive(
        &self,
        mut upload: Upload,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, UploadError> {
        let stats = UploadStats::for_upload(&upload);
        info!(status = %upload.status, attempt = upload.attempt, "Running upload");

        loop {
            let stage = match upload.status {
                UploadStatus::Waiting
                | UploadStatus::GeneratingLoadFiles
                | UploadStatus::Failed(UploadStage::GeneratingLoadFiles) => {
                    UploadStage::GeneratingLoadFiles
                },
                UploadStatus::ExportingData | UploadStatus::Failed(UploadStage::ExportingData) => {
                    UploadStage::ExportingData
                },
                UploadStatus::ExportedData | UploadStatus::Aborted => {
                    return Ok(RunOutcome::AlreadyTerminal)
                },
            };

            let result = match stage {
                UploadStage::GeneratingLoadFiles => self.generate_load_files(&upload, cancel).await?,
                UploadStage::ExportingData => self.export_data(&upload, cancel, &stats).await?,
            };

            if let StageResult::Failed(message) = result {
                return self.fail_stage(&upload, stage, &message, &stats).await;
            }

            if stage == UploadStage::ExportingData {
                return self.finish(&upload, &stats).await;
            }

            upload = self
                .uploads
                .get(upload.id)
                .await?
                .ok_or(UploadError::NotFound(upload.id))?;
        }
    }

    /// Publishes (or resumes) the load-file batch and waits for it.
    async fn generate_load_files(
        &self,
        upload: &Upload,
        cancel: &CancellationToken,
    ) -> Result<StageResult, UploadError> {
        let batch_id = match (upload.status, upload.job_batch_id) {
            (UploadStatus::GeneratingLoadFiles, Some(batch_id)) => {
                info!(%batch_id, "Resuming load file batch");
                batch_id
            },
            _ => match self.publish_load_file_jobs(upload).await? {
                Some(batch_id) => batch_id,
                None => {
                    return Ok(StageResult::Failed(format!(
                        "no staging files between {} and {}",
                        upload.start_staging_file_id, upload.end_staging_file_id
                    )))
                },
            },
        };

        let results = match self.queue.await_batch(batch_id, cancel).await {
            Ok(results) => results,
            Err(NotifierError::Cancelled(_)) => return Err(UploadError::Cancelled),
            Err(NotifierError::UnknownBatch(_)) => {
                return Ok(StageResult::Failed(format!(
                    "load file batch {} has no jobs",
                    batch_id
                )))
            },
            Err(e) => return Err(e.into()),
        };

        let failures: Vec<String> = results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| {
                format!(
                    "job {} {}: {}",
                    r.job_id,
                    r.status,
                    r.error.as_deref().unwrap_or("no error recorded")
                )
            })
            .collect();
        if !failures.is_empty() {
            return Ok(StageResult::Failed(format!(
                "{} of {} load file jobs did not succeed: {}",
                failures.len(),
                results.len(),
                failures.join("; ")
            )));
        }

        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            let output = result.output.unwrap_or(serde_json::Value::Null);
            match serde_json::from_value::<LoadFileOutput>(output) {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    return Ok(StageResult::Failed(format!(
                        "job {} returned malformed output: {}",
                        result.job_id, e
                    )))
                },
            }
        }

        let saved = self.uploads.save_load_files(upload.id, &outputs).await?;
        let tables: Vec<String> = outputs
            .iter()
            .flat_map(|o| o.load_files.iter().map(|f| f.table_name.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.tracker.create(upload.id, &tables).await?;
        self.tracker
            .set_status_many(
                upload.id,
                &[TableUploadStatus::Waiting],
                TableUploadStatus::Executing,
            )
            .await?;
        self.uploads.start_export(upload.id).await?;

        info!(load_files = saved, tables = tables.len(), "Load files generated");
        Ok(StageResult::Done)
    }

    async fn publish_load_file_jobs(&self, upload: &Upload) -> Result<Option<Uuid>, UploadError> {
        let staging_files = self.uploads.staging_files(upload).await?;
        if staging_files.is_empty() {
            return Ok(None);
        }

        let jobs: Vec<LoadFileJob> = staging_files
            .iter()
            .map(|file| LoadFileJob::new(upload, file))
            .collect();
        let batch_id = self.queue.publish(LOAD_FILES_JOB, &jobs).await?;
        self.uploads.start_generation(upload.id, batch_id).await?;

        info!(%batch_id, jobs = jobs.len(), "Published load file jobs");
        Ok(Some(batch_id))
    }

    /// Loads every `executing` table. Tables that failed or were interrupted
    /// in an earlier run are re-armed first; exported tables are left alone.
    async fn export_data(
        &self,
        upload: &Upload,
        cancel: &CancellationToken,
        stats: &UploadStats,
    ) -> Result<StageResult, UploadError> {
        let rearmed = self
            .tracker
            .set_status_many(
                upload.id,
                &[
                    TableUploadStatus::Waiting,
                    TableUploadStatus::ExportingData,
                    TableUploadStatus::Failed,
                ],
                TableUploadStatus::Executing,
            )
            .await?;
        if rearmed > 0 {
            info!(tables = rearmed, "Re-armed tables for loading");
        }
        self.uploads.start_export(upload.id).await?;

        let loader = match self.loaders.get(&upload.destination_type) {
            Ok(loader) => loader,
            Err(e) => return Ok(StageResult::Failed(e.to_string())),
        };

        let tables: Vec<String> = self
            .tracker
            .list_by_upload(upload.id)
            .await?
            .into_iter()
            .filter(|t| t.status == TableUploadStatus::Executing)
            .map(|t| t.table_name)
            .collect();

        let results: Vec<Result<TableLoad, UploadError>> = stream::iter(tables)
            .map(|table| self.load_table(upload, loader.clone(), table, cancel, stats))
            .buffer_unordered(self.config.max_parallel_loads.max(1))
            .collect()
            .await;

        let mut failed = Vec::new();
        let mut skipped = false;
        let mut loaded = 0u64;
        for result in results {
            match result? {
                TableLoad::Loaded(rows) => loaded += rows,
                TableLoad::Failed { table, error } => failed.push(format!("{}: {}", table, error)),
                TableLoad::Skipped => skipped = true,
            }
        }

        if skipped {
            return Err(UploadError::Cancelled);
        }
        if !failed.is_empty() {
            return Ok(StageResult::Failed(format!(
                "{} table(s) failed to load: {}",
                failed.len(),
                failed.join("; ")
            )));
        }

        info!(rows = loaded, "All tables loaded");
        Ok(StageResult::Done)
    }

    async fn load_table(
        &self,
        upload: &Upload,
        loader: Arc<dyn WarehouseLoader>,
        table: String,
        cancel: &CancellationToken,
        stats: &UploadStats,
    ) -> Result<TableLoad, UploadError> {
        if cancel.is_cancelled() {
            return Ok(TableLoad::Skipped);
        }

        self.tracker
            .set_status(upload.id, &table, TableUploadStatus::ExportingData, None)
            .await?;
        let load_files = self.uploads.load_files_for_table(upload.id, &table).await?;

        let result = tokio::select! {
            result = loader.load_table(&upload.namespace, &table, &load_files) => result,
            _ = cancel.cancelled() => return Ok(TableLoad::Skipped),
        };

        match result {
            Ok(rows) => {
                self.tracker
                    .record_count(upload.id, &table, rows as i64)
                    .await?;
                self.tracker
                    .set_status(upload.id, &table, TableUploadStatus::ExportedData, None)
                    .await?;
                stats.record_table_rows(&table, rows);
                info!(%table, rows, "Table exported");
                Ok(TableLoad::Loaded(rows))
            },
            Err(e) => {
                let error = e.to_string();
                warn!(%table, error = %error, "Table load failed");
                self.tracker
                    .set_status(upload.id, &table, TableUploadStatus::Failed, Some(&error))
                    .await?;
                Ok(TableLoad::Failed { table, error })
            },
        }
    }

    async fn finish(&self, upload: &Upload, stats: &UploadStats) -> Result<RunOutcome, UploadError> {
        self.uploads.mark_exported(upload.id).await?;

        let loaded: i64 = self
            .tracker
            .list_by_upload(upload.id)
            .await?
            .iter()
            .filter_map(|t| t.row_count)
            .sum();
        stats.record_success(
            loaded.max(0) as u64,
            upload.staged_events.max(0) as u64,
            upload.first_event_at,
        );

        info!(loaded_events = loaded, "Upload exported");
        Ok(RunOutcome::Exported)
    }

    /// Records a failed stage run: schedules the next attempt with capped
    /// exponential backoff, or aborts when attempts are exhausted.
    async fn fail_stage(
        &self,
        upload: &Upload,
        stage: UploadStage,
        message: &str,
        stats: &UploadStats,
    ) -> Result<RunOutcome, UploadError> {
        let attempt = upload.attempt + 1;
        let exhausted = attempt >= self.config.max_attempts;
        let next_retry_time = if exhausted {
            None
        } else {
            let delay = self.config.backoff().delay(attempt.max(1) as u32);
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(self.config.retry_cap_secs as i64));
            Some(Utc::now() + delay)
        };

        let status = self
            .uploads
            .record_failure(
                upload.id,
                &StageFailure {
                    stage,
                    message,
                    attempt,
                    next_retry_time,
                },
            )
            .await?;

        match next_retry_time {
            Some(next_retry_time) => {
                stats.record_stage_failure(stage.as_str());
                warn!(%stage, attempt, %next_retry_time, error = %message, "Upload stage failed, retry scheduled");
                Ok(RunOutcome::Retrying {
                    stage,
                    next_retry_time,
                })
            },
            None => {
                stats.record_aborted(upload.staged_events.max(0) as u64);
                error!(%stage, attempt, %status, error = %message, "Upload aborted");
                Ok(RunOutcome::Aborted)
            },
        }
    }
}
