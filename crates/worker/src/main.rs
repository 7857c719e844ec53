mod cli;
mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use backtestq_analysis::{EngineAdapter, NarrativeAdapter, SecretGuard};
use backtestq_core::{AnalysisInput, NewJob};
use backtestq_infra::jobs::{
    JobStore, Orchestrator, PgJobStore, StaleJobSweeper, WorkerPool, WorkerPoolConfig,
};
use backtestq_infra::{FsArtifactWriter, HttpAnalysisEngine, HttpNarrator, PgCoverageSource};
use backtestq_observability::TracingConfig;
use backtestq_pipeline::{AuditConfig, Auditor, Preflight, PreflightConfig};

use cli::{Cli, Command};
use config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(cli.config.as_deref())?;

    backtestq_observability::subscriber::init(&TracingConfig {
        format: config.log_format,
        ..TracingConfig::default()
    });

    match cli.command {
        Command::Run => run(&config).await,
        Command::Sweep { once } => sweep(&config, once).await,
        Command::InitDb => {
            let store = PgJobStore::new(connect(&config).await?);
            store.ensure_schema().await?;
            info!("job schema ready");
            Ok(())
        }
        Command::Submit { input, max_retries } => {
            submit(&config, &input, max_retries.unwrap_or(config.max_retries)).await
        }
        Command::Stats => {
            let store = PgJobStore::new(connect(&config).await?);
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn connect(config: &WorkerConfig) -> Result<PgPool> {
    let url = config.database_url()?;
    // One connection per worker plus headroom for the sweeper and narratives.
    let max_connections = u32::try_from(config.workers).unwrap_or(u32::MAX).saturating_add(2);
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to postgres")
}

fn build_orchestrator(config: &WorkerConfig, pool: PgPool) -> Result<Orchestrator> {
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));

    let preflight = Preflight::new(
        Arc::new(PgCoverageSource::new(pool)),
        PreflightConfig {
            allow_full_universe: config.allow_full_universe,
        },
    );

    let engine = HttpAnalysisEngine::new(config.engine_url()?).context("failed to build engine client")?;
    let engine = EngineAdapter::new(Arc::new(engine), config.execution_timeout());

    let auditor = Auditor::new(AuditConfig {
        negligible_return_pct: config.negligible_return_pct,
        advisory_recurrence: config.advisory_recurrence,
    });

    let mut orchestrator = Orchestrator::new(store, preflight, engine)
        .with_auditor(auditor)
        .with_artifacts(Arc::new(FsArtifactWriter::new(config.results_dir.clone())))
        .with_retry_mode(config.retry_mode);

    match config.narrator_url.as_deref() {
        Some(url) => {
            let narrator = HttpNarrator::new(url).context("failed to build narrator client")?;
            let guard = SecretGuard::new().context("failed to compile secret patterns")?;
            orchestrator = orchestrator.with_narrator(NarrativeAdapter::new(
                Arc::new(narrator),
                config.narrative_timeout(),
                guard,
            ));
        }
        None => info!("narrator_url not set; narratives will be skipped"),
    }

    Ok(orchestrator)
}

async fn run(config: &WorkerConfig) -> Result<()> {
    let pool = connect(config).await?;
    let orchestrator = build_orchestrator(config, pool)?;

    let sweeper = StaleJobSweeper::new(
        orchestrator.store().clone(),
        config.stale_after(),
        config.sweep_interval(),
    )
    .spawn();

    let workers = WorkerPool::spawn(
        orchestrator,
        WorkerPoolConfig::default()
            .with_workers(config.workers)
            .with_poll_interval(config.poll_interval()),
    );

    info!(
        workers = config.workers,
        retry_mode = ?config.retry_mode,
        results_dir = %config.results_dir.display(),
        "worker pool started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    let stats = workers.stats();
    workers.shutdown().await;
    sweeper.shutdown().await;
    info!(
        processed = stats.jobs_processed,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        requeued = stats.jobs_requeued,
        conflicts = stats.conflicts,
        "worker pool stopped"
    );
    Ok(())
}

async fn sweep(config: &WorkerConfig, once: bool) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(connect(config).await?));
    let sweeper = StaleJobSweeper::new(store, config.stale_after(), config.sweep_interval());

    if once {
        let requeued = sweeper.sweep_once().await?;
        info!(requeued = requeued.len(), "sweep complete");
        return Ok(());
    }

    let handle = sweeper.spawn();
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    handle.shutdown().await;
    Ok(())
}

async fn submit(config: &WorkerConfig, path: &Path, max_retries: u32) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let input: AnalysisInput =
        serde_json::from_str(&raw).with_context(|| format!("invalid analysis input in {}", path.display()))?;

    let job = NewJob::from_input(&input)?.with_max_retries(max_retries);
    let store = PgJobStore::new(connect(config).await?);
    let id = store.enqueue(job).await?;

    println!("{id}");
    Ok(())
}
