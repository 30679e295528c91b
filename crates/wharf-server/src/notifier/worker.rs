//! Job workers
//!
//! Each worker task claims one job at a time, keeps its lease alive with a
//! heartbeat and reports the outcome. Idle workers sleep for the poll
//! interval (with jitter) unless a `NOTIFY` on the wake-up channel arrives
//! first.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wharf_common::backoff::jitter;

use super::types::{Job, JobOutcome};
use super::{JobQueue, NotifierError, SHUTDOWN_ERROR, WAKEUP_CHANNEL};
use crate::uploads::load_files::{LoadFileGenerator, LoadFileJob, LOAD_FILES_JOB};

const LISTENER_RETRY: Duration = Duration::from_secs(5);

/// Pool of queue workers sharing one wake-up listener
pub struct WorkerPool {
    queue: JobQueue,
    generator: Arc<LoadFileGenerator>,
    identity: String,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, generator: Arc<LoadFileGenerator>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let identity = format!(
            "{}-{}-{}",
            host,
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        Self {
            queue,
            generator,
            identity,
        }
    }

    /// Worker id of the `n`th task in this pool
    pub fn worker_id(&self, n: usize) -> String {
        format!("{}-{}", self.identity, n)
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let workers = self.queue.config().workers;
        if workers == 0 {
            info!("No queue workers configured");
            return;
        }

        let wake = Arc::new(Notify::new());
        let listener = tokio::spawn(listen_for_wakeups(
            self.queue.pool().clone(),
            wake.clone(),
            cancel.clone(),
        ));

        let this = Arc::new(self);
        let mut tasks = JoinSet::new();
        for n in 0..workers {
            let worker_id = this.worker_id(n);
            let span = info_span!("queue_worker", worker_id = %worker_id);
            tasks.spawn(
                this.clone()
                    .worker_loop(worker_id, wake.clone(), cancel.clone())
                    .instrument(span),
            );
        }
        info!(workers, "Queue workers started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Queue worker task panicked");
            }
        }

        listener.abort();
        info!("Queue workers stopped");
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: String,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        let poll = self.queue.config().poll_interval();

        while !cancel.is_cancelled() {
            match self.queue.claim(&worker_id).await {
                Ok(Some(job)) => {
                    self.process(&worker_id, job, &cancel).await;
                    continue;
                },
                Ok(None) => {},
                Err(e) => warn!(error = %e, "Failed to claim job"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => debug!("Woken by publish notification"),
                _ = tokio::time::sleep(jitter(poll, 0.2)) => {},
            }
        }
    }

    /// Executes a claimed job and reports its outcome.
    ///
    /// On cancellation the job is reported failed rather than left running.
    /// If the lease is lost mid-run the result is discarded.
    pub async fn process(&self, worker_id: &str, job: Job, cancel: &CancellationToken) {
        let job_id = job.id;
        let lease_lost = CancellationToken::new();
        let heartbeat = self.start_heartbeat(job_id, worker_id.to_string(), lease_lost.clone());

        let outcome = tokio::select! {
            result = self.execute(&job) => match result {
                Ok(output) => JobOutcome::Succeeded(output),
                Err(e) => JobOutcome::Failed(format!("{:#}", e)),
            },
            _ = cancel.cancelled() => JobOutcome::Failed(SHUTDOWN_ERROR.to_string()),
            _ = lease_lost.cancelled() => {
                heartbeat.abort();
                warn!(job_id, "Lease lost while executing, discarding work");
                return;
            },
        };
        heartbeat.abort();

        if let JobOutcome::Failed(error) = &outcome {
            warn!(job_id, job_type = %job.job_type, error = %error, "Job failed");
        }

        match self.queue.complete(job_id, worker_id, outcome).await {
            Ok(status) => info!(job_id, %status, "Job finished"),
            Err(NotifierError::NotOwner { .. }) => {
                warn!(job_id, "Lease lost before completion, result discarded");
            },
            Err(e) => error!(job_id, error = %e, "Failed to record job outcome"),
        }
    }

    async fn execute(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        match job.job_type.as_str() {
            LOAD_FILES_JOB => {
                let payload: LoadFileJob = serde_json::from_value(job.payload.clone())?;
                let output = self.generator.generate(&payload).await?;
                Ok(serde_json::to_value(output)?)
            },
            other => anyhow::bail!("Unknown job type '{}'", other),
        }
    }

    fn start_heartbeat(
        &self,
        job_id: i64,
        worker_id: String,
        lease_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let every = queue.config().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match queue.renew_lease(job_id, &worker_id).await {
                    Ok(()) => debug!(job_id, "Lease renewed"),
                    Err(NotifierError::NotOwner { .. }) => {
                        lease_lost.cancel();
                        return;
                    },
                    Err(e) => warn!(job_id, error = %e, "Failed to renew lease"),
                }
            }
        })
    }
}

async fn listen_for_wakeups(pool: PgPool, wake: Arc<Notify>, cancel: CancellationToken) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Wake-up listener unavailable, relying on polling");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(LISTENER_RETRY) => continue,
                }
            },
        };

        if let Err(e) = listener.listen(WAKEUP_CHANNEL).await {
            warn!(error = %e, "Failed to LISTEN on wake-up channel");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(LISTENER_RETRY) => continue,
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = listener.recv() => match received {
                    Ok(_) => wake.notify_waiters(),
                    Err(e) => {
                        warn!(error = %e, "Wake-up listener dropped");
                        break;
                    },
                },
            }
        }
    }
}
