//! Wharf server - Main entry point

use anyhow::Result;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wharf_common::logging::{init_logging, LogConfig};

use wharf_server::{
    api,
    async_jobs::AsyncJobRunner,
    config::{Config, DatabaseConfig},
    db,
    features::FeatureState,
    loader::{LoaderRegistry, PostgresLoader},
    notifier::{JobQueue, Reaper, WorkerPool},
    storage::{FileManager, S3FileManager, StorageConfig},
    uploads::{
        LoadFileGenerator, TableUploadTracker, UploadLocks, UploadOrchestrator, UploadRepository,
        UploadScheduler,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::default()
        .with_file_prefix("wharf-server")
        .with_filter("wharf_server=debug,tower_http=info,sqlx=warn")
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting Wharf server");

    let config = Config::load()?;
    info!(
        mode = config.mode.as_str(),
        "Configuration loaded - server will bind to {}:{}", config.server.host, config.server.port
    );

    let db_pool = db::create_pool(&config.database).await?;
    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database migrations completed");

    let files: Arc<dyn FileManager> = Arc::new(S3FileManager::new(StorageConfig::from_env()?).await?);
    info!("Storage client initialized");

    let destination_pool = if config.postgres_destination_url() == config.database.url {
        db_pool.clone()
    } else {
        db::create_pool(&DatabaseConfig {
            url: config.postgres_destination_url().to_string(),
            ..config.database.clone()
        })
        .await?
    };
    let loaders = LoaderRegistry::new().register(
        "POSTGRES",
        Arc::new(PostgresLoader::new(destination_pool, files.clone())),
    );
    info!(destination_types = ?loaders.destination_types(), "Warehouse loaders registered");

    let queue = JobQueue::new(db_pool.clone(), config.notifier.clone());
    let async_jobs = AsyncJobRunner::new(db_pool.clone(), loaders.clone(), config.async_jobs.clone());

    let cancel = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if config.mode.runs_workers() {
        let generator = Arc::new(LoadFileGenerator::new(
            files.clone(),
            config.uploads.load_file_prefix.clone(),
        ));
        background.push(WorkerPool::new(queue.clone(), generator).start(cancel.child_token()));
    }

    if config.mode.runs_orchestration() {
        background.push(Reaper::new(queue.clone()).start(cancel.child_token()));

        let uploads = UploadRepository::new(db_pool.clone());
        let orchestrator = Arc::new(UploadOrchestrator::new(
            uploads.clone(),
            TableUploadTracker::new(db_pool.clone()),
            queue.clone(),
            loaders.clone(),
            config.uploads.clone(),
        ));
        let locks = UploadLocks::new(
            db_pool.clone(),
            config.uploads.lock_lease(),
            format!("{}-{}", config.server.host, std::process::id()),
        );
        background.push(
            UploadScheduler::new(uploads, locks, orchestrator, config.uploads.clone())
                .start(cancel.child_token()),
        );
        background.push(async_jobs.clone().start(cancel.child_token()));
    }

    let app = api::create_router(
        FeatureState {
            db: db_pool.clone(),
            async_jobs,
        },
        &config.cors,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    info!(tasks = background.len(), "Waiting up to {:?} for background tasks", timeout);

    match tokio::time::timeout(timeout, futures::future::join_all(background)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
            info!("Server shut down gracefully");
            Ok(())
        },
        Err(_) => {
            error!("Background tasks did not stop within {:?}", timeout);
            std::process::exit(1);
        },
    }
}

/// Resolves on Ctrl+C or SIGTERM and cancels background work.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("Received terminate signal, starting graceful shutdown"),
    }

    cancel.cancel();
}
