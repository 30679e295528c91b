//! Upload lifecycle integration tests
//!
//! Each test runs real queue workers against a fresh database and an
//! in-memory object store; destinations are scripted.
//!
//! Coverage includes:
//! - Full export of a multi-table upload
//! - Retry and abort when load file generation keeps failing
//! - Partial table failures, re-armed tables and recovery
//! - Terminal uploads rejecting further writes
//! - Upload locks and the scheduler
//! - Success and abort metrics

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use wharf_server::notifier::{JobQueue, WorkerPool};
use wharf_server::storage::MemoryFileManager;
use wharf_server::uploads::{
    RunOutcome, TableUploadStatus, TableUploadTracker, UploadError, UploadLocks, UploadRepository,
    UploadScheduler, UploadStage, UploadStatus,
};

mod common;
use common::{ScriptedLoader, DESTINATION_ID, SOURCE_ID};

const TABLES: [&str; 3] = ["pages", "tracks", "users"];

struct Harness {
    pool: PgPool,
    files: MemoryFileManager,
    loader: Arc<ScriptedLoader>,
    cancel: CancellationToken,
    workers: JoinHandle<()>,
}

impl Harness {
    async fn start(pool: PgPool) -> Self {
        common::seed_warehouse(&pool).await;
        let files = MemoryFileManager::new();
        let cancel = CancellationToken::new();
        let workers = WorkerPool::new(
            JobQueue::new(pool.clone(), common::fast_notifier()),
            common::generator(&files),
        )
        .start(cancel.child_token());

        Self {
            pool,
            files,
            loader: ScriptedLoader::new(),
            cancel,
            workers,
        }
    }

    async fn stage(&self, key: &str, rows_per_table: usize) -> i64 {
        common::seed_staging_file(&self.pool, &self.files, key, &TABLES, rows_per_table).await
    }

    async fn run(&self, upload_id: i64) -> RunOutcome {
        common::orchestrator(&self.pool, &self.loader, common::fast_uploads())
            .run(upload_id, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn upload_status(&self, upload_id: i64) -> UploadStatus {
        UploadRepository::new(self.pool.clone())
            .get(upload_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn table_statuses(&self, upload_id: i64) -> Vec<(String, TableUploadStatus)> {
        TableUploadTracker::new(self.pool.clone())
            .list_by_upload(upload_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.table_name, t.status))
            .collect()
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.workers.await.unwrap();
    }
}

/// Counter totals by metric name, summed over labels.
fn counters(snapshotter: &Snapshotter) -> HashMap<String, u64> {
    let mut totals = HashMap::new();
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        if let DebugValue::Counter(count) = value {
            *totals.entry(key.key().name().to_string()).or_insert(0) += count;
        }
    }
    totals
}

// ============================================================================
// Happy Path
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_upload_exports_every_table(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 2).await;
    harness.stage("staging/2.json", 3).await;
    let upload_id = common::create_upload(&harness.pool).await;

    assert_eq!(harness.run(upload_id).await, RunOutcome::Exported);

    let upload = UploadRepository::new(harness.pool.clone())
        .get(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::ExportedData);
    assert_eq!(upload.attempt, 0);
    assert_eq!(upload.staged_events, 15);

    let tables = TableUploadTracker::new(harness.pool.clone())
        .list_by_upload(upload_id)
        .await
        .unwrap();
    assert_eq!(tables.len(), 3);
    for table in &tables {
        assert_eq!(table.status, TableUploadStatus::ExportedData, "{}", table.table_name);
        assert_eq!(table.row_count, Some(5));
        assert!(table.last_exec_at.is_some());
        assert!(table.error.is_none());
        assert_eq!(harness.loader.load_count(&table.table_name), 1);
    }

    let load_files: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wh_load_files WHERE upload_id = $1")
            .bind(upload_id)
            .fetch_one(&harness.pool)
            .await
            .unwrap();
    assert_eq!(load_files, 6);

    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_rerunning_exported_upload_is_noop(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 1).await;
    let upload_id = common::create_upload(&harness.pool).await;

    assert_eq!(harness.run(upload_id).await, RunOutcome::Exported);
    assert_eq!(harness.run(upload_id).await, RunOutcome::AlreadyTerminal);

    for table in TABLES {
        assert_eq!(harness.loader.load_count(table), 1);
    }
    harness.stop().await;
}

// ============================================================================
// Failures and Retries
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_generation_failure_aborts_after_max_attempts(pool: PgPool) {
    let harness = Harness::start(pool).await;
    common::register_staging_file(
        &harness.pool,
        &MemoryFileManager::location("staging/missing.json"),
        10,
    )
    .await;
    let upload_id = common::create_upload(&harness.pool).await;

    let first = harness.run(upload_id).await;
    let RunOutcome::Retrying {
        stage,
        next_retry_time: first_retry,
    } = first
    else {
        panic!("expected a retry, got {:?}", first);
    };
    assert_eq!(stage, UploadStage::GeneratingLoadFiles);
    assert_eq!(
        harness.upload_status(upload_id).await,
        UploadStatus::Failed(UploadStage::GeneratingLoadFiles)
    );

    let second = harness.run(upload_id).await;
    let RunOutcome::Retrying {
        next_retry_time: second_retry,
        ..
    } = second
    else {
        panic!("expected a retry, got {:?}", second);
    };
    assert!(second_retry > first_retry);

    assert_eq!(harness.run(upload_id).await, RunOutcome::Aborted);

    let upload = UploadRepository::new(harness.pool.clone())
        .get(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Aborted);
    assert_eq!(upload.attempt, 3);
    assert!(upload.next_retry_time.is_none());
    assert_eq!(upload.error_stage.as_deref(), Some("generating_load_files"));
    let errors = upload.error["generating_load_files_failed"]["errors"]
        .as_array()
        .unwrap();
    assert_eq!(errors.len(), 3);
    assert!(harness.table_statuses(upload_id).await.is_empty());

    assert_eq!(harness.run(upload_id).await, RunOutcome::AlreadyTerminal);
    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_partial_table_failures_abort_and_keep_exported_tables(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 2).await;
    harness.loader.fail_table("pages");
    harness.loader.fail_table("users");
    let upload_id = common::create_upload(&harness.pool).await;

    let outcome = harness.run(upload_id).await;
    assert!(matches!(
        outcome,
        RunOutcome::Retrying {
            stage: UploadStage::ExportingData,
            ..
        }
    ));
    assert_eq!(
        harness.table_statuses(upload_id).await,
        vec![
            ("pages".to_string(), TableUploadStatus::Failed),
            ("tracks".to_string(), TableUploadStatus::ExportedData),
            ("users".to_string(), TableUploadStatus::Failed),
        ]
    );

    assert!(matches!(harness.run(upload_id).await, RunOutcome::Retrying { .. }));
    assert_eq!(harness.run(upload_id).await, RunOutcome::Aborted);

    assert_eq!(harness.upload_status(upload_id).await, UploadStatus::Aborted);
    assert_eq!(harness.loader.load_count("tracks"), 1);
    assert_eq!(harness.loader.load_count("pages"), 3);
    assert_eq!(harness.loader.load_count("users"), 3);

    let tables = TableUploadTracker::new(harness.pool.clone())
        .list_by_upload(upload_id)
        .await
        .unwrap();
    let users = tables.iter().find(|t| t.table_name == "users").unwrap();
    assert!(users.error.as_deref().unwrap().contains("destination rejected users"));

    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_failed_tables_recover_on_retry(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 2).await;
    harness.loader.fail_table("users");
    let upload_id = common::create_upload(&harness.pool).await;

    assert!(matches!(harness.run(upload_id).await, RunOutcome::Retrying { .. }));

    harness.loader.heal_table("users");
    assert_eq!(harness.run(upload_id).await, RunOutcome::Exported);

    assert_eq!(harness.loader.load_count("users"), 2);
    assert_eq!(harness.loader.load_count("tracks"), 1);
    assert_eq!(harness.loader.load_count("pages"), 1);
    assert!(harness
        .table_statuses(upload_id)
        .await
        .iter()
        .all(|(_, status)| *status == TableUploadStatus::ExportedData));

    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_tracker_rejects_writes_on_terminal_upload(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 1).await;
    let upload_id = common::create_upload(&harness.pool).await;
    assert_eq!(harness.run(upload_id).await, RunOutcome::Exported);

    let tracker = TableUploadTracker::new(harness.pool.clone());
    let result = tracker
        .set_status(upload_id, "tracks", TableUploadStatus::Failed, Some("late"))
        .await;
    assert!(matches!(result, Err(UploadError::Terminal(id)) if id == upload_id));
    assert!(matches!(
        tracker.create(upload_id, &["extra".to_string()]).await,
        Err(UploadError::Terminal(_))
    ));
    assert!(matches!(
        tracker.set_status(9_999, "tracks", TableUploadStatus::Failed, None).await,
        Err(UploadError::NotFound(9_999))
    ));

    harness.stop().await;
}

// ============================================================================
// Metrics
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_export_records_success_metrics(pool: PgPool) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 2).await;
    harness.stage("staging/2.json", 3).await;
    let upload_id = common::create_upload(&harness.pool).await;
    assert_eq!(harness.run(upload_id).await, RunOutcome::Exported);

    let totals = counters(&snapshotter);
    assert_eq!(totals.get("num_staged_events"), Some(&15));
    assert_eq!(totals.get("num_loaded_events"), Some(&15));
    assert_eq!(totals.get("upload_success"), Some(&1));
    for table in TABLES {
        assert_eq!(
            totals.get(&format!("{}_table_records_uploaded", table)),
            Some(&5),
            "{}",
            table
        );
    }
    assert!(!totals.contains_key("upload_aborted"));
    assert!(!totals.contains_key("upload_stage_failed"));

    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_abort_records_failure_metrics(pool: PgPool) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 2).await;
    harness.loader.fail_table("pages");
    harness.loader.fail_table("users");
    let upload_id = common::create_upload(&harness.pool).await;

    assert!(matches!(harness.run(upload_id).await, RunOutcome::Retrying { .. }));
    assert!(matches!(harness.run(upload_id).await, RunOutcome::Retrying { .. }));
    assert_eq!(harness.run(upload_id).await, RunOutcome::Aborted);

    let totals = counters(&snapshotter);
    assert_eq!(totals.get("upload_stage_failed"), Some(&2));
    assert_eq!(totals.get("upload_aborted"), Some(&1));
    assert_eq!(totals.get("num_staged_events"), Some(&6));
    assert_eq!(totals.get("tracks_table_records_uploaded"), Some(&2));
    assert!(!totals.contains_key("upload_success"));
    assert!(!totals.contains_key("num_loaded_events"));

    harness.stop().await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_cancelled_run_resumes_later(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 1).await;
    harness.loader.set_delay(Duration::from_secs(30));
    let upload_id = common::create_upload(&harness.pool).await;

    let cancel = CancellationToken::new();
    let run = {
        let orchestrator =
            common::orchestrator(&harness.pool, &harness.loader, common::fast_uploads());
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(upload_id, &cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while harness.upload_status(upload_id).await != UploadStatus::ExportingData {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("upload never reached exporting_data");

    cancel.cancel();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(harness.upload_status(upload_id).await, UploadStatus::ExportingData);

    harness.loader.set_delay(Duration::ZERO);
    assert_eq!(harness.run(upload_id).await, RunOutcome::Exported);

    harness.stop().await;
}

// ============================================================================
// Locks and Scheduling
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_upload_lock_is_exclusive(pool: PgPool) {
    let a = UploadLocks::new(pool.clone(), Duration::from_secs(60), "node-a");
    let b = UploadLocks::new(pool.clone(), Duration::from_secs(60), "node-b");

    let token = a.acquire(SOURCE_ID, DESTINATION_ID).await.unwrap().unwrap();
    assert!(b.acquire(SOURCE_ID, DESTINATION_ID).await.unwrap().is_none());
    a.renew(&token).await.unwrap();

    sqlx::query("UPDATE wh_upload_locks SET lease_expires_at = NOW() - INTERVAL '1 second'")
        .execute(&pool)
        .await
        .unwrap();
    let stolen = b.acquire(SOURCE_ID, DESTINATION_ID).await.unwrap().unwrap();

    assert!(matches!(a.renew(&token).await, Err(UploadError::LeaseLost { .. })));
    a.release(&token).await.unwrap();
    b.renew(&stolen).await.unwrap();

    b.release(&stolen).await.unwrap();
    assert!(a.acquire(SOURCE_ID, DESTINATION_ID).await.unwrap().is_some());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_scheduler_creates_and_runs_upload(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 1).await;

    let uploads = UploadRepository::new(harness.pool.clone());
    let scheduler = UploadScheduler::new(
        uploads.clone(),
        UploadLocks::new(harness.pool.clone(), Duration::from_secs(60), "test"),
        Arc::new(common::orchestrator(
            &harness.pool,
            &harness.loader,
            common::fast_uploads(),
        )),
        common::fast_uploads(),
    );

    let cancel = CancellationToken::new();
    let mut running = JoinSet::new();
    assert_eq!(scheduler.schedule_once(&mut running, &cancel).await.unwrap(), 1);
    while running.join_next().await.is_some() {}

    let upload_id: i64 = sqlx::query_scalar("SELECT id FROM wh_uploads")
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(harness.upload_status(upload_id).await, UploadStatus::ExportedData);

    let locks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wh_upload_locks")
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(locks, 0);

    // Nothing new staged.
    assert_eq!(scheduler.schedule_once(&mut running, &cancel).await.unwrap(), 0);

    harness.stage("staging/2.json", 1).await;
    assert_eq!(scheduler.schedule_once(&mut running, &cancel).await.unwrap(), 1);
    while running.join_next().await.is_some() {}
    let exported: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wh_uploads WHERE status = 'exported_data'")
            .fetch_one(&harness.pool)
            .await
            .unwrap();
    assert_eq!(exported, 2);

    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_scheduler_lock_error_skips_only_that_destination(pool: PgPool) {
    let harness = Harness::start(pool).await;
    harness.stage("staging/1.json", 1).await;

    sqlx::query(
        r#"
        INSERT INTO wh_warehouses (source_id, destination_id, destination_type, namespace)
        VALUES ('broken-src', $1, $2, $3)
        "#,
    )
    .bind(DESTINATION_ID)
    .bind(common::DESTINATION_TYPE)
    .bind(common::NAMESPACE)
    .execute(&harness.pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO wh_staging_files (source_id, destination_id, location, total_events)
        VALUES ('broken-src', $1, 'memory://staging/broken.json', 1)
        "#,
    )
    .bind(DESTINATION_ID)
    .execute(&harness.pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        CREATE FUNCTION reject_broken_lock() RETURNS trigger AS $$
        BEGIN
            IF NEW.source_id = 'broken-src' THEN
                RAISE EXCEPTION 'lock table unavailable';
            END IF;
            RETURN NEW;
        END
        $$ LANGUAGE plpgsql
        "#,
    )
    .execute(&harness.pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        CREATE TRIGGER reject_broken_lock BEFORE INSERT ON wh_upload_locks
        FOR EACH ROW EXECUTE FUNCTION reject_broken_lock()
        "#,
    )
    .execute(&harness.pool)
    .await
    .unwrap();

    let scheduler = UploadScheduler::new(
        UploadRepository::new(harness.pool.clone()),
        UploadLocks::new(harness.pool.clone(), Duration::from_secs(60), "test"),
        Arc::new(common::orchestrator(
            &harness.pool,
            &harness.loader,
            common::fast_uploads(),
        )),
        common::fast_uploads(),
    );

    let mut running = JoinSet::new();
    assert_eq!(
        scheduler
            .schedule_once(&mut running, &CancellationToken::new())
            .await
            .unwrap(),
        1
    );
    while running.join_next().await.is_some() {}

    let uploads: Vec<(String, String)> =
        sqlx::query_as("SELECT source_id, status FROM wh_uploads ORDER BY id")
            .fetch_all(&harness.pool)
            .await
            .unwrap();
    assert_eq!(uploads, vec![(SOURCE_ID.to_string(), "exported_data".to_string())]);

    harness.stop().await;
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_scheduler_skips_uploads_backing_off(pool: PgPool) {
    let harness = Harness::start(pool).await;
    common::register_staging_file(
        &harness.pool,
        &MemoryFileManager::location("staging/missing.json"),
        1,
    )
    .await;
    let upload_id = common::create_upload(&harness.pool).await;

    let config = wharf_server::uploads::UploadConfig {
        retry_base_secs: 600,
        retry_cap_secs: 600,
        ..common::fast_uploads()
    };
    assert!(matches!(
        common::orchestrator(&harness.pool, &harness.loader, config.clone())
            .run(upload_id, &CancellationToken::new())
            .await
            .unwrap(),
        RunOutcome::Retrying { .. }
    ));

    let scheduler = UploadScheduler::new(
        UploadRepository::new(harness.pool.clone()),
        UploadLocks::new(harness.pool.clone(), Duration::from_secs(60), "test"),
        Arc::new(common::orchestrator(&harness.pool, &harness.loader, config.clone())),
        config,
    );
    let mut running = JoinSet::new();
    assert_eq!(
        scheduler
            .schedule_once(&mut running, &CancellationToken::new())
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        harness.upload_status(upload_id).await,
        UploadStatus::Failed(UploadStage::GeneratingLoadFiles)
    );

    harness.stop().await;
}
