//! Upload metrics
//!
//! Emitted through the `metrics` facade; whichever recorder the binary
//! installs receives them.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};

use super::models::Upload;

/// Event tables that get a dedicated `<table>_table_records_uploaded` counter
pub const TRACKED_TABLES: [&str; 8] = [
    "tracks",
    "users",
    "identifies",
    "pages",
    "screens",
    "aliases",
    "groups",
    "rudder_discards",
];

/// Destination-labelled counters for one upload
#[derive(Debug, Clone)]
pub struct UploadStats {
    source_id: String,
    destination_id: String,
    destination_type: String,
}

impl UploadStats {
    pub fn for_upload(upload: &Upload) -> Self {
        Self {
            source_id: upload.source_id.clone(),
            destination_id: upload.destination_id.clone(),
            destination_type: upload.destination_type.clone(),
        }
    }

    /// Upload reached `exported_data`.
    pub fn record_success(
        &self,
        loaded_events: u64,
        staged_events: u64,
        first_event_at: Option<DateTime<Utc>>,
    ) {
        self.counter("num_loaded_events", loaded_events);
        self.counter("num_staged_events", staged_events);
        self.counter("upload_success", 1);

        if let Some(first_event_at) = first_event_at {
            let delay = (Utc::now() - first_event_at).num_milliseconds().max(0) as f64 / 1000.0;
            histogram!(
                "load_delay_in_sec",
                "source_id" => self.source_id.clone(),
                "destination_id" => self.destination_id.clone(),
                "destination_type" => self.destination_type.clone()
            )
            .record(delay);
        }
    }

    /// Upload was aborted after exhausting its attempts.
    pub fn record_aborted(&self, staged_events: u64) {
        self.counter("num_staged_events", staged_events);
        self.counter("upload_aborted", 1);
    }

    /// A stage run failed and will be retried.
    pub fn record_stage_failure(&self, stage: &str) {
        counter!(
            "upload_stage_failed",
            "source_id" => self.source_id.clone(),
            "destination_id" => self.destination_id.clone(),
            "destination_type" => self.destination_type.clone(),
            "stage" => stage.to_string()
        )
        .increment(1);
    }

    pub fn record_table_rows(&self, table: &str, rows: u64) {
        if TRACKED_TABLES.contains(&table) {
            self.counter(format!("{}_table_records_uploaded", table), rows);
        }
    }

    fn counter(&self, name: impl Into<metrics::SharedString>, value: u64) {
        counter!(
            name.into(),
            "source_id" => self.source_id.clone(),
            "destination_id" => self.destination_id.clone(),
            "destination_type" => self.destination_type.clone()
        )
        .increment(value);
    }
}
