//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Worker for the asynchronous analysis job queue.
#[derive(Debug, Parser)]
#[command(name = "backtestq-worker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file (defaults to `backtestq.toml` when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker pool and the stale-job sweeper until interrupted.
    Run,

    /// Requeue stranded jobs.
    Sweep {
        /// Sweep once and exit instead of looping.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Create the jobs table if missing.
    InitDb,

    /// Enqueue a job from a JSON input document.
    Submit {
        /// Path to the input document.
        input: PathBuf,

        /// Retry ceiling for this job (defaults to the configured `max_retries`).
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Print job counts per status as JSON.
    Stats,
}
