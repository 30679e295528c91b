use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::JobQueue;

/// Periodically recovers jobs whose worker stopped heartbeating.
pub struct Reaper {
    queue: JobQueue,
}

impl Reaper {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(info_span!("job_reaper")))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.queue.config().reaper_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            match self.queue.reap_expired().await {
                Ok(summary) if summary.requeued + summary.aborted > 0 => info!(
                    requeued = summary.requeued,
                    aborted = summary.aborted,
                    "Reaped expired job leases"
                ),
                Ok(_) => {},
                Err(e) => error!(error = %e, "Lease reaper sweep failed"),
            }
        }

        info!("Lease reaper stopped");
    }
}
