//! Upload scheduler
//!
//! Every interval: find warehouses with pending work, take the pair lock,
//! find or create the upload and hand it to an orchestrator. A semaphore
//! bounds how many uploads run at once; the lock lease is renewed while the
//! orchestrator runs and released when it returns.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::lock::{LockToken, UploadLocks};
use super::models::{Upload, Warehouse};
use super::orchestrator::{RunOutcome, UploadOrchestrator};
use super::repository::UploadRepository;
use super::{UploadConfig, UploadError};

pub struct UploadScheduler {
    uploads: UploadRepository,
    locks: UploadLocks,
    orchestrator: Arc<UploadOrchestrator>,
    config: UploadConfig,
    permits: Arc<Semaphore>,
}

impl UploadScheduler {
    pub fn new(
        uploads: UploadRepository,
        locks: UploadLocks,
        orchestrator: Arc<UploadOrchestrator>,
        config: UploadConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel_uploads.max(1)));
        Self {
            uploads,
            locks,
            orchestrator,
            config,
            permits,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(info_span!("upload_scheduler")))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut running = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.scheduler_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            max_parallel_uploads = self.config.max_parallel_uploads,
            "Upload scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Upload task panicked");
                }
            }

            match self.schedule_once(&mut running, &cancel).await {
                Ok(0) => {},
                Ok(started) => debug!(started, "Scheduled uploads"),
                Err(e) => error!(error = %e, "Scheduling cycle failed"),
            }
        }

        info!(running = running.len(), "Waiting for running uploads to stop");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Upload task panicked");
            }
        }
        info!("Upload scheduler stopped");
    }

    /// One scheduling pass; returns how many uploads were started.
    pub async fn schedule_once(
        &self,
        running: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Result<usize, UploadError> {
        let warehouses = self.uploads.warehouses_with_pending_work().await?;
        let mut started = 0;

        for warehouse in warehouses {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("All upload slots busy");
                break;
            };

            let token = match self
                .locks
                .acquire(&warehouse.source_id, &warehouse.destination_id)
                .await
            {
                Ok(Some(token)) => token,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        source_id = %warehouse.source_id,
                        destination_id = %warehouse.destination_id,
                        error = %e,
                        "Could not acquire upload lock"
                    );
                    continue;
                },
            };

            let upload = match self.prepare_upload(&warehouse).await {
                Ok(Some(upload)) => upload,
                Ok(None) => {
                    self.release(&token).await;
                    continue;
                },
                Err(e) => {
                    warn!(
                        source_id = %warehouse.source_id,
                        destination_id = %warehouse.destination_id,
                        error = %e,
                        "Could not prepare upload"
                    );
                    self.release(&token).await;
                    continue;
                },
            };

            if let Err(e) = self.locks.attach(&token, upload.id).await {
                warn!(upload_id = upload.id, error = %e, "Lost upload lock before start");
                continue;
            }

            running.spawn(run_locked(
                self.orchestrator.clone(),
                self.locks.clone(),
                token,
                upload.id,
                self.config.lock_heartbeat_interval(),
                permit,
                cancel.child_token(),
            ));
            started += 1;
        }

        Ok(started)
    }

    async fn release(&self, token: &LockToken) {
        if let Err(e) = self.locks.release(token).await {
            warn!(
                source_id = %token.source_id,
                destination_id = %token.destination_id,
                error = %e,
                "Failed to release upload lock"
            );
        }
    }

    /// The pair's unfinished upload, or a new one over fresh staging files.
    /// `None` when there is nothing to do yet.
    async fn prepare_upload(&self, warehouse: &Warehouse) -> Result<Option<Upload>, UploadError> {
        let upload = match self
            .uploads
            .find_active(&warehouse.source_id, &warehouse.destination_id)
            .await?
        {
            Some(upload) => upload,
            None => match self
                .uploads
                .pending_staging_range(
                    &warehouse.source_id,
                    &warehouse.destination_id,
                    self.config.staging_files_batch_size,
                )
                .await?
            {
                Some(range) => self.uploads.create(warehouse, &range).await?,
                None => return Ok(None),
            },
        };

        if upload.is_backing_off(Utc::now()) {
            debug!(upload_id = upload.id, next_retry_time = ?upload.next_retry_time, "Upload waiting for retry");
            return Ok(None);
        }

        Ok(Some(upload))
    }
}

/// Runs one upload while renewing its lock, then releases the lock.
async fn run_locked(
    orchestrator: Arc<UploadOrchestrator>,
    locks: UploadLocks,
    token: LockToken,
    upload_id: i64,
    heartbeat_every: std::time::Duration,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let span = info_span!(
        "scheduled_upload",
        upload_id,
        source_id = %token.source_id,
        destination_id = %token.destination_id
    );

    async move {
        let heartbeat = {
            let locks = locks.clone();
            let token = token.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat_every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {},
                    }
                    match locks.renew(&token).await {
                        Ok(()) => {},
                        Err(UploadError::LeaseLost { .. }) => {
                            warn!("Upload lock lost, stopping run");
                            cancel.cancel();
                            return;
                        },
                        Err(e) => warn!(error = %e, "Failed to renew upload lock"),
                    }
                }
            })
        };

        match orchestrator.run(upload_id, &cancel).await {
            Ok(RunOutcome::Exported) => info!("Upload run finished: exported"),
            Ok(RunOutcome::Aborted) => warn!("Upload run finished: aborted"),
            Ok(outcome) => debug!(?outcome, "Upload run finished"),
            Err(e) => error!(error = %e, "Upload run failed"),
        }

        heartbeat.abort();
        if let Err(e) = locks.release(&token).await {
            warn!(error = %e, "Failed to release upload lock");
        }
    }
    .instrument(span)
    .await
}
