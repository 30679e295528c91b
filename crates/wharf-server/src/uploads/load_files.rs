//! Load-file generation, the work done by queue workers
//!
//! A staging file is newline-delimited JSON where every line carries its
//! destination table:
//!
//! ```json
//! {"metadata": {"table": "tracks"}, "data": {"id": "e1", "event": "signup"}}
//! ```
//!
//! The generator splits it into one newline-delimited load file per table,
//! holding only the `data` objects.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::models::{StagingFile, Upload};
use crate::loader::sanitize_identifier;
use crate::storage::FileManager;

/// Queue job type handled by [`LoadFileGenerator`]
pub const LOAD_FILES_JOB: &str = "generate_load_files";

/// Payload of one load-file job: a single staging file of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFileJob {
    pub upload_id: i64,
    pub staging_file_id: i64,
    pub staging_file_location: String,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub namespace: String,
}

impl LoadFileJob {
    pub fn new(upload: &Upload, staging_file: &StagingFile) -> Self {
        Self {
            upload_id: upload.id,
            staging_file_id: staging_file.id,
            staging_file_location: staging_file.location.clone(),
            source_id: upload.source_id.clone(),
            destination_id: upload.destination_id.clone(),
            destination_type: upload.destination_type.clone(),
            namespace: upload.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedLoadFile {
    pub table_name: String,
    pub location: String,
    pub total_rows: i64,
}

/// Job output: the load files written for one staging file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFileOutput {
    pub staging_file_id: i64,
    pub load_files: Vec<GeneratedLoadFile>,
}

#[derive(Debug, Deserialize)]
struct StagedEvent {
    metadata: StagedEventMetadata,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StagedEventMetadata {
    table: String,
}

pub struct LoadFileGenerator {
    files: Arc<dyn FileManager>,
    prefix: String,
}

impl LoadFileGenerator {
    pub fn new(files: Arc<dyn FileManager>, prefix: impl Into<String>) -> Self {
        Self {
            files,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Object key of the load file for `table` produced from `job`.
    ///
    /// Stable per (upload, staging file, table), so a re-run overwrites
    /// instead of accumulating objects.
    pub fn object_key(&self, job: &LoadFileJob, table: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}-{}.json",
            self.prefix,
            job.source_id,
            job.destination_id,
            job.namespace,
            table,
            job.upload_id,
            job.staging_file_id
        )
    }

    #[instrument(skip(self, job), fields(upload_id = job.upload_id, staging_file_id = job.staging_file_id))]
    pub async fn generate(&self, job: &LoadFileJob) -> anyhow::Result<LoadFileOutput> {
        let bytes = self
            .files
            .download(&job.staging_file_location)
            .await
            .with_context(|| format!("downloading staging file {}", job.staging_file_location))?;
        let text = std::str::from_utf8(&bytes).context("staging file is not valid UTF-8")?;

        let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: StagedEvent = serde_json::from_str(line)
                .with_context(|| format!("line {} of {}", n + 1, job.staging_file_location))?;
            let table = sanitize_identifier(&event.metadata.table)?;
            tables
                .entry(table)
                .or_default()
                .push(serde_json::to_string(&event.data)?);
        }

        let mut load_files = Vec::with_capacity(tables.len());
        for (table, rows) in tables {
            let key = self.object_key(job, &table);
            let total_rows = rows.len() as i64;
            let mut body = rows.join("\n");
            body.push('\n');

            let location = self
                .files
                .upload(&key, body.into_bytes())
                .await
                .with_context(|| format!("uploading load file {}", key))?;
            debug!(%table, total_rows, %location, "Wrote load file");

            load_files.push(GeneratedLoadFile {
                table_name: table,
                location,
                total_rows,
            });
        }

        Ok(LoadFileOutput {
            staging_file_id: job.staging_file_id,
            load_files,
        })
    }
}
