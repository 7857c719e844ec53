//! Stale-job sweeper: returns stranded `in_progress` rows to the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use backtestq_core::JobId;

use super::store::{JobStore, JobStoreError};

/// Requeues rows whose last heartbeat is older than `stale_after`.
///
/// `stale_after` must exceed the execution timeout, otherwise a healthy job
/// could be taken from its worker mid-execution.
#[derive(Clone)]
pub struct StaleJobSweeper {
    store: Arc<dyn JobStore>,
    stale_after: Duration,
    interval: Duration,
}

impl StaleJobSweeper {
    pub fn new(store: Arc<dyn JobStore>, stale_after: Duration, interval: Duration) -> Self {
        Self {
            store,
            stale_after,
            interval,
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|stale| now.checked_sub_signed(stale))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One sweep.
    pub async fn sweep_once(&self) -> Result<Vec<JobId>, JobStoreError> {
        let requeued = self.store.requeue_stale(self.cutoff()).await?;
        for job_id in &requeued {
            warn!(job_id = %job_id, stale_after_secs = self.stale_after.as_secs(), "requeued stranded job");
        }
        Ok(requeued)
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "stale-job sweeper started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match self.sweep_once().await {
                    Ok(ids) if ids.is_empty() => debug!("no stranded jobs"),
                    Ok(ids) => info!(requeued = ids.len(), "sweep requeued jobs"),
                    Err(e) => error!(error = %e, "sweep failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    changed = shutdown_rx.changed() => {
                        // Handle dropped without an explicit shutdown.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("stale-job sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to control and join the sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the sweeper to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(j) = self.join.take() {
            let _ = j.await;
        }
    }
}
