//! Worker pool: N independent poll loops over one job store.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::orchestrator::{JobOutcome, Orchestrator, OrchestratorError, ProcessReport};
use super::store::JobStoreError;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent poll loops
    pub workers: usize,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(5),
            name: "backtestq-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    /// Persistence conflicts: a job touched by two orchestrators.
    pub conflicts: u64,
    pub store_errors: u64,
    pub advisory_findings: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record_report(&mut self, report: &ProcessReport) {
        self.jobs_processed += 1;
        self.advisory_findings += report.advisory_findings as u64;
        match report.outcome {
            JobOutcome::Completed => self.jobs_completed += 1,
            JobOutcome::Failed => self.jobs_failed += 1,
            JobOutcome::Requeued => self.jobs_requeued += 1,
        }
    }

    fn record_error(&mut self, error: &OrchestratorError) {
        if error.is_conflict() {
            self.conflicts += 1;
        } else {
            self.store_errors += 1;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("claim failed: {0}")]
    Claim(#[from] JobStoreError),
    #[error(transparent)]
    Process(#[from] OrchestratorError),
}

/// Claim one job and drive it to its next resting state.
///
/// `Ok(None)` means the queue was empty.
pub async fn poll_once(orchestrator: &Orchestrator) -> Result<Option<ProcessReport>, WorkerError> {
    let Some(job) = orchestrator.store().claim_next_pending().await? else {
        return Ok(None);
    };
    info!(job_id = %job.id, retry_count = job.retry_count, "claimed job");
    Ok(Some(orchestrator.process(job).await?))
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every loop to finish its current job.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Spawns poll loops. Loops share nothing but the orchestrator's configuration
/// and the store; the store's claim is the only coordination.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(orchestrator: Orchestrator, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins = (0..config.workers.max(1))
            .map(|index| {
                let worker = format!("{}-{}", config.name, index);
                let span = info_span!("worker", worker = %worker);
                tokio::spawn(
                    worker_loop(
                        worker,
                        orchestrator.clone(),
                        config.poll_interval,
                        shutdown_rx.clone(),
                        stats.clone(),
                    )
                    .instrument(span),
                )
            })
            .collect();

        info!(pool = %config.name, workers = config.workers, "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(
    worker: String,
    orchestrator: Orchestrator,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    debug!(worker = %worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match poll_once(&orchestrator).await {
            Ok(Some(report)) => {
                stats.lock().unwrap_or_else(|p| p.into_inner()).record_report(&report);
                debug!(worker = %worker, outcome = ?report.outcome, "job processed");
                continue;
            }
            Ok(None) => debug!(worker = %worker, "no pending jobs"),
            Err(WorkerError::Claim(JobStoreError::ClaimConflict(reason))) => {
                debug!(worker = %worker, reason = %reason, "claim lost a race; polling again");
                continue;
            }
            Err(WorkerError::Claim(e)) => error!(worker = %worker, error = %e, "failed to claim job"),
            Err(WorkerError::Process(e)) => {
                stats.lock().unwrap_or_else(|p| p.into_inner()).record_error(&e);
                // Conflicts are already logged loudly; abandon the job and keep polling.
                if !e.is_conflict() {
                    warn!(worker = %worker, error = %e, "job processing aborted");
                }
                continue;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                // Handle dropped without an explicit shutdown.
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker = %worker, "worker stopped");
}
