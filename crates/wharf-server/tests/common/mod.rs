//! Shared fixtures for wharf-server integration tests
//!
//! Database tests run under `#[sqlx::test(migrations = "../../migrations")]`,
//! which hands each test a fresh database. The helpers here seed warehouses
//! and staging files, and provide a scripted destination loader.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wharf_server::loader::{LoadFileRef, LoaderError, LoaderRegistry, WarehouseLoader};
use wharf_server::notifier::{JobQueue, NotifierConfig};
use wharf_server::storage::{FileManager, MemoryFileManager};
use wharf_server::uploads::{
    LoadFileGenerator, TableUploadTracker, UploadConfig, UploadOrchestrator, UploadRepository,
};

pub const SOURCE_ID: &str = "src-1";
pub const DESTINATION_ID: &str = "dst-1";
pub const DESTINATION_TYPE: &str = "POSTGRES";
pub const NAMESPACE: &str = "analytics";

/// Destination loader whose behaviour is set per table
#[derive(Default)]
pub struct ScriptedLoader {
    failing_tables: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    loads: Mutex<HashMap<String, usize>>,
    maintenance_calls: AtomicUsize,
    maintenance_error: Mutex<Option<String>>,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_table(&self, table: &str) {
        self.failing_tables
            .lock()
            .unwrap()
            .insert(table.to_string());
    }

    pub fn heal_table(&self, table: &str) {
        self.failing_tables.lock().unwrap().remove(table);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_maintenance(&self, error: &str) {
        *self.maintenance_error.lock().unwrap() = Some(error.to_string());
    }

    /// Times `load_table` ran for `table`, including failed runs
    pub fn load_count(&self, table: &str) -> usize {
        self.loads.lock().unwrap().get(table).copied().unwrap_or(0)
    }

    pub fn maintenance_count(&self) -> usize {
        self.maintenance_calls.load(Ordering::SeqCst)
    }

    fn current_delay(&self) -> Option<Duration> {
        *self.delay.lock().unwrap()
    }

    pub fn registry(self: &Arc<Self>) -> LoaderRegistry {
        LoaderRegistry::new().register(DESTINATION_TYPE, self.clone())
    }
}

#[async_trait]
impl WarehouseLoader for ScriptedLoader {
    async fn load_table(
        &self,
        _namespace: &str,
        table: &str,
        load_files: &[LoadFileRef],
    ) -> Result<u64, LoaderError> {
        *self.loads.lock().unwrap().entry(table.to_string()).or_default() += 1;

        if let Some(delay) = self.current_delay() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_tables.lock().unwrap().contains(table) {
            return Err(LoaderError::Other(anyhow::anyhow!(
                "destination rejected {}",
                table
            )));
        }
        Ok(load_files.iter().map(|f| f.total_rows.max(0) as u64).sum())
    }

    async fn run_maintenance(
        &self,
        _job_type: &str,
        _namespace: &str,
        _table: &str,
        _metadata: &serde_json::Value,
    ) -> Result<(), LoaderError> {
        self.maintenance_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.current_delay() {
            tokio::time::sleep(delay).await;
        }
        match self.maintenance_error.lock().unwrap().clone() {
            Some(error) => Err(LoaderError::Other(anyhow::anyhow!(error))),
            None => Ok(()),
        }
    }
}

/// Notifier settings tuned for tests: fast polling, short leases.
pub fn fast_notifier() -> NotifierConfig {
    NotifierConfig {
        workers: 2,
        poll_interval_ms: 20,
        lease_secs: 30,
        max_attempts: 3,
        reaper_interval_secs: 1,
    }
}

/// Upload settings with the production attempt limit and tiny backoff.
pub fn fast_uploads() -> UploadConfig {
    UploadConfig {
        retry_base_secs: 1,
        retry_cap_secs: 2,
        scheduler_interval_secs: 1,
        ..Default::default()
    }
}

pub async fn seed_warehouse(pool: &PgPool) {
    sqlx::query(
        r#"
        INSERT INTO wh_warehouses (source_id, destination_id, destination_type, namespace)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(SOURCE_ID)
    .bind(DESTINATION_ID)
    .bind(DESTINATION_TYPE)
    .bind(NAMESPACE)
    .execute(pool)
    .await
    .unwrap();
}

/// One staged NDJSON line routed to `table`
pub fn event_line(table: &str, id: usize) -> String {
    serde_json::json!({
        "metadata": { "table": table },
        "data": { "id": format!("{}-{}", table, id), "n": id },
    })
    .to_string()
}

/// Writes a staging object with `rows_per_table` events for each table and
/// registers it in `wh_staging_files`. Returns the staging file id.
pub async fn seed_staging_file(
    pool: &PgPool,
    files: &MemoryFileManager,
    key: &str,
    tables: &[&str],
    rows_per_table: usize,
) -> i64 {
    let lines: Vec<String> = tables
        .iter()
        .flat_map(|table| (0..rows_per_table).map(move |n| event_line(table, n)))
        .collect();
    let location = files
        .upload(key, lines.join("\n").into_bytes())
        .await
        .unwrap();

    register_staging_file(pool, &location, lines.len() as i64).await
}

/// Registers a staging file row without writing its object.
pub async fn register_staging_file(pool: &PgPool, location: &str, total_events: i64) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO wh_staging_files (
            source_id, destination_id, location, total_events, first_event_at, last_event_at
        )
        VALUES ($1, $2, $3, $4, NOW() - INTERVAL '5 minutes', NOW())
        RETURNING id
        "#,
    )
    .bind(SOURCE_ID)
    .bind(DESTINATION_ID)
    .bind(location)
    .bind(total_events)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Creates a `waiting` upload covering every uncovered staging file.
pub async fn create_upload(pool: &PgPool) -> i64 {
    let uploads = UploadRepository::new(pool.clone());
    let warehouse = uploads
        .get_warehouse(SOURCE_ID, DESTINATION_ID)
        .await
        .unwrap()
        .expect("warehouse seeded");
    let range = uploads
        .pending_staging_range(SOURCE_ID, DESTINATION_ID, 960)
        .await
        .unwrap()
        .expect("staging files seeded");
    uploads.create(&warehouse, &range).await.unwrap().id
}

pub fn orchestrator(
    pool: &PgPool,
    loader: &Arc<ScriptedLoader>,
    config: UploadConfig,
) -> UploadOrchestrator {
    UploadOrchestrator::new(
        UploadRepository::new(pool.clone()),
        TableUploadTracker::new(pool.clone()),
        JobQueue::new(pool.clone(), fast_notifier()),
        loader.registry(),
        config,
    )
}

pub fn generator(files: &MemoryFileManager) -> Arc<LoadFileGenerator> {
    Arc::new(LoadFileGenerator::new(
        Arc::new(files.clone()),
        "wharf-load-objects",
    ))
}

/// Inserts an `exported_data` upload with the given tables exported.
pub async fn seed_exported_upload(pool: &PgPool, tables: &[&str]) -> i64 {
    let upload_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO wh_uploads (
            source_id, destination_id, destination_type, namespace, status,
            start_staging_file_id, end_staging_file_id
        )
        VALUES ($1, $2, $3, $4, 'exported_data', 1, 1)
        RETURNING id
        "#,
    )
    .bind(SOURCE_ID)
    .bind(DESTINATION_ID)
    .bind(DESTINATION_TYPE)
    .bind(NAMESPACE)
    .fetch_one(pool)
    .await
    .unwrap();

    let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
    sqlx::query(
        r#"
        INSERT INTO wh_table_uploads (upload_id, table_name, status, row_count)
        SELECT $1, t, 'exported_data', 1 FROM UNNEST($2::TEXT[]) AS t
        "#,
    )
    .bind(upload_id)
    .bind(&tables)
    .execute(pool)
    .await
    .unwrap();

    upload_id
}
