//! Async maintenance job integration tests
//!
//! Coverage includes:
//! - Fan-out of one request to every table of the latest exported upload
//! - Execution, retries and abort on timeout
//! - Status by job id and by job/task run
//! - Request validation and stale job reset

use sqlx::PgPool;
use std::time::Duration;

use wharf_server::async_jobs::{
    AsyncJobConfig, AsyncJobError, AsyncJobRunner, AsyncJobStatus, StartJobRequest,
};

mod common;
use common::{ScriptedLoader, DESTINATION_ID, SOURCE_ID};

fn request(job_run_id: &str) -> StartJobRequest {
    StartJobRequest {
        source_id: SOURCE_ID.to_string(),
        job_kind: "async_job".to_string(),
        channel: "sources".to_string(),
        destination_id: DESTINATION_ID.to_string(),
        start_time: "2026-01-15T10:00:00Z".to_string(),
        job_run_id: job_run_id.to_string(),
        task_run_id: "task-1".to_string(),
        async_job_type: "DELETEBYJOBRUNID".to_string(),
    }
}

fn fast_config() -> AsyncJobConfig {
    AsyncJobConfig {
        timeout_secs: 1,
        retry_interval_secs: 1,
        ..Default::default()
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_request_fans_out_and_succeeds(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["tracks", "users"]).await;
    let loader = ScriptedLoader::new();
    let runner = AsyncJobRunner::new(pool.clone(), loader.registry(), fast_config());

    let response = runner.enqueue(&request("run-1")).await.unwrap();
    assert_eq!(response.jobids.len(), 2);
    assert!(response.error.is_none());

    let job = runner.get(response.jobids[0]).await.unwrap();
    assert_eq!(job.status, AsyncJobStatus::Waiting);
    assert_eq!(job.job_type, "deletebyjobrunid");
    assert_eq!(job.metadata["job_run_id"], "run-1");
    assert_eq!(job.metadata["task_run_id"], "task-1");

    let waiting = runner
        .get_status_by_run(SOURCE_ID, DESTINATION_ID, "run-1", "task-1")
        .await
        .unwrap();
    assert_eq!(waiting.status, "waiting");

    assert_eq!(runner.run_cycle().await.unwrap(), 2);
    assert_eq!(loader.maintenance_count(), 2);

    for id in &response.jobids {
        let status = runner.get_status(*id).await.unwrap();
        assert_eq!(status.status, "succeeded");
        assert!(status.error.is_none());
        assert_eq!(runner.get(*id).await.unwrap().attempt, 1);
    }
    let done = runner
        .get_status_by_run(SOURCE_ID, DESTINATION_ID, "run-1", "task-1")
        .await
        .unwrap();
    assert_eq!(done.status, "succeeded");

    assert_eq!(runner.run_cycle().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_timed_out_job_aborts_after_max_attempts(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["tracks"]).await;
    let loader = ScriptedLoader::new();
    loader.set_delay(Duration::from_secs(5));
    let runner = AsyncJobRunner::new(pool.clone(), loader.registry(), fast_config());

    let job_id = runner.enqueue(&request("run-2")).await.unwrap().jobids[0];

    assert_eq!(runner.run_cycle().await.unwrap(), 1);
    let job = runner.get(job_id).await.unwrap();
    assert_eq!(job.status, AsyncJobStatus::Failed);
    assert_eq!(job.attempt, 1);
    assert!(job.error.as_deref().unwrap().contains("timed out"));

    assert_eq!(runner.run_cycle().await.unwrap(), 1);
    assert_eq!(runner.run_cycle().await.unwrap(), 1);
    let job = runner.get(job_id).await.unwrap();
    assert_eq!(job.status, AsyncJobStatus::Aborted);
    assert_eq!(job.attempt, 3);

    assert_eq!(runner.run_cycle().await.unwrap(), 0);
    let status = runner
        .get_status_by_run(SOURCE_ID, DESTINATION_ID, "run-2", "task-1")
        .await
        .unwrap();
    assert_eq!(status.status, "aborted");
    assert!(status.error.unwrap().contains("timed out"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_loader_error_is_recorded(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["tracks"]).await;
    let loader = ScriptedLoader::new();
    loader.fail_maintenance("permission denied for table tracks");
    let runner = AsyncJobRunner::new(pool.clone(), loader.registry(), fast_config());

    let job_id = runner.enqueue(&request("run-3")).await.unwrap().jobids[0];
    runner.run_cycle().await.unwrap();

    let status = runner.get_status(job_id).await.unwrap();
    assert_eq!(status.status, "failed");
    assert!(status.error.unwrap().contains("permission denied"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_enqueue_uses_latest_exported_upload(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["old_table"]).await;
    common::seed_exported_upload(&pool, &["tracks", "users", "pages"]).await;
    let runner = AsyncJobRunner::new(pool.clone(), ScriptedLoader::new().registry(), fast_config());

    let response = runner.enqueue(&request("run-4")).await.unwrap();
    let mut tables = Vec::new();
    for id in response.jobids {
        tables.push(runner.get(id).await.unwrap().table_name);
    }
    tables.sort();
    assert_eq!(tables, vec!["pages", "tracks", "users"]);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_enqueue_without_exported_upload(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    let runner = AsyncJobRunner::new(pool.clone(), ScriptedLoader::new().registry(), fast_config());

    let result = runner.enqueue(&request("run-5")).await;
    assert!(matches!(result, Err(AsyncJobError::NoTables { .. })));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_enqueue_validates_request(pool: PgPool) {
    let runner = AsyncJobRunner::new(pool.clone(), ScriptedLoader::new().registry(), fast_config());

    let mut missing_run = request("");
    missing_run.job_run_id = "  ".to_string();
    assert!(matches!(
        runner.enqueue(&missing_run).await,
        Err(AsyncJobError::InvalidRequest(m)) if m.contains("job_run_id")
    ));

    let mut bad_time = request("run-6");
    bad_time.start_time = "yesterday".to_string();
    assert!(matches!(
        runner.enqueue(&bad_time).await,
        Err(AsyncJobError::InvalidRequest(m)) if m.contains("start_time")
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_unknown_job_and_run(pool: PgPool) {
    let runner = AsyncJobRunner::new(pool.clone(), ScriptedLoader::new().registry(), fast_config());

    assert!(matches!(runner.get_status(42).await, Err(AsyncJobError::NotFound(42))));
    assert!(matches!(
        runner
            .get_status_by_run(SOURCE_ID, DESTINATION_ID, "nope", "nope")
            .await,
        Err(AsyncJobError::RunNotFound { .. })
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_reset_stale_returns_executing_jobs_to_waiting(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["tracks"]).await;
    let runner = AsyncJobRunner::new(pool.clone(), ScriptedLoader::new().registry(), fast_config());
    let job_id = runner.enqueue(&request("run-7")).await.unwrap().jobids[0];

    sqlx::query("UPDATE wh_async_jobs SET status = 'executing' WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(runner.reset_stale().await.unwrap(), 1);
    assert_eq!(runner.get(job_id).await.unwrap().status, AsyncJobStatus::Waiting);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_live_lease_survives_another_runner(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["tracks"]).await;
    let loader = ScriptedLoader::new();
    loader.set_delay(Duration::from_millis(500));
    let config = AsyncJobConfig {
        timeout_secs: 5,
        ..fast_config()
    };
    let first = AsyncJobRunner::new(pool.clone(), loader.registry(), config.clone());
    let second = AsyncJobRunner::new(pool.clone(), loader.registry(), config);
    assert_ne!(first.identity(), second.identity());

    let job_id = first.enqueue(&request("run-8")).await.unwrap().jobids[0];
    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run_cycle().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while first.get(job_id).await.unwrap().status != AsyncJobStatus::Executing {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(second.reset_stale().await.unwrap(), 0);
    assert_eq!(second.run_cycle().await.unwrap(), 0);
    assert_eq!(first.get(job_id).await.unwrap().status, AsyncJobStatus::Executing);

    assert_eq!(running.await.unwrap().unwrap(), 1);
    let job = first.get(job_id).await.unwrap();
    assert_eq!(job.status, AsyncJobStatus::Succeeded);
    assert_eq!(job.attempt, 1);
    assert_eq!(loader.maintenance_count(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_expired_lease_is_reclaimed_by_next_cycle(pool: PgPool) {
    common::seed_warehouse(&pool).await;
    common::seed_exported_upload(&pool, &["tracks"]).await;
    let loader = ScriptedLoader::new();
    let runner = AsyncJobRunner::new(pool.clone(), loader.registry(), fast_config());
    let job_id = runner.enqueue(&request("run-9")).await.unwrap().jobids[0];

    sqlx::query(
        r#"
        UPDATE wh_async_jobs
        SET status = 'executing', owner = 'crashed-runner',
            lease_expires_at = NOW() - INTERVAL '1 second'
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(runner.run_cycle().await.unwrap(), 1);
    let job = runner.get(job_id).await.unwrap();
    assert_eq!(job.status, AsyncJobStatus::Succeeded);
    assert_eq!(job.attempt, 1);
    assert_eq!(loader.maintenance_count(), 1);
}
