//! Worker configuration loaded from `backtestq.toml`.
//!
//! Every key is optional. `BACKTESTQ_*` environment variables take precedence
//! over the file, and `DATABASE_URL` is honoured when
//! `BACKTESTQ_DATABASE_URL` is unset.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IntoDeserializer};

use backtestq_infra::jobs::RetryMode;
use backtestq_observability::LogFormat;
use backtestq_pipeline::AdvisoryRecurrence;

const DEFAULT_PATH: &str = "backtestq.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    /// Concurrent poll loops.
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// Retry ceiling for jobs enqueued with `submit`.
    pub max_retries: u32,
    pub execution_timeout_secs: u64,
    pub narrative_timeout_secs: u64,
    /// An `in_progress` row untouched for this long is considered stranded.
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub results_dir: PathBuf,
    pub engine_url: Option<String>,
    /// Narratives are skipped when unset.
    pub narrator_url: Option<String>,
    pub allow_full_universe: bool,
    pub retry_mode: RetryMode,
    pub advisory_recurrence: AdvisoryRecurrence,
    pub negligible_return_pct: f64,
    pub log_format: LogFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workers: 2,
            poll_interval_ms: 5_000,
            max_retries: backtestq_core::DEFAULT_MAX_RETRIES,
            execution_timeout_secs: 600,
            narrative_timeout_secs: 60,
            stale_after_secs: 1_800,
            sweep_interval_secs: 60,
            results_dir: PathBuf::from("outputs/backtesting_results"),
            engine_url: None,
            narrator_url: None,
            allow_full_universe: false,
            retry_mode: RetryMode::InProcess,
            advisory_recurrence: AdvisoryRecurrence::SharedBudget,
            negligible_return_pct: 0.01,
            log_format: LogFormat::Json,
        }
    }
}

impl WorkerConfig {
    /// Load from `path`, or from `backtestq.toml` in the working directory when
    /// present, then apply the process environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_PATH).exists() => Self::from_file(Path::new(DEFAULT_PATH))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Override fields from environment variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("BACKTESTQ_DATABASE_URL").or_else(|| get("DATABASE_URL")) {
            self.database_url = Some(url);
        }
        if let Some(url) = get("BACKTESTQ_ENGINE_URL") {
            self.engine_url = Some(url);
        }
        if let Some(url) = get("BACKTESTQ_NARRATOR_URL") {
            self.narrator_url = Some(url);
        }
        if let Some(dir) = get("BACKTESTQ_RESULTS_DIR") {
            self.results_dir = PathBuf::from(dir);
        }

        parse_into(get("BACKTESTQ_WORKERS"), "BACKTESTQ_WORKERS", &mut self.workers)?;
        parse_into(get("BACKTESTQ_POLL_INTERVAL_MS"), "BACKTESTQ_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        parse_into(get("BACKTESTQ_MAX_RETRIES"), "BACKTESTQ_MAX_RETRIES", &mut self.max_retries)?;
        parse_into(
            get("BACKTESTQ_EXECUTION_TIMEOUT_SECS"),
            "BACKTESTQ_EXECUTION_TIMEOUT_SECS",
            &mut self.execution_timeout_secs,
        )?;
        parse_into(
            get("BACKTESTQ_NARRATIVE_TIMEOUT_SECS"),
            "BACKTESTQ_NARRATIVE_TIMEOUT_SECS",
            &mut self.narrative_timeout_secs,
        )?;
        parse_into(get("BACKTESTQ_STALE_AFTER_SECS"), "BACKTESTQ_STALE_AFTER_SECS", &mut self.stale_after_secs)?;
        parse_into(
            get("BACKTESTQ_SWEEP_INTERVAL_SECS"),
            "BACKTESTQ_SWEEP_INTERVAL_SECS",
            &mut self.sweep_interval_secs,
        )?;
        parse_into(
            get("BACKTESTQ_ALLOW_FULL_UNIVERSE"),
            "BACKTESTQ_ALLOW_FULL_UNIVERSE",
            &mut self.allow_full_universe,
        )?;
        parse_into(
            get("BACKTESTQ_NEGLIGIBLE_RETURN_PCT"),
            "BACKTESTQ_NEGLIGIBLE_RETURN_PCT",
            &mut self.negligible_return_pct,
        )?;
        variant_into(get("BACKTESTQ_RETRY_MODE"), "BACKTESTQ_RETRY_MODE", &mut self.retry_mode)?;
        variant_into(
            get("BACKTESTQ_ADVISORY_RECURRENCE"),
            "BACKTESTQ_ADVISORY_RECURRENCE",
            &mut self.advisory_recurrence,
        )?;
        variant_into(get("BACKTESTQ_LOG_FORMAT"), "BACKTESTQ_LOG_FORMAT", &mut self.log_format)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        if self.execution_timeout_secs == 0 || self.narrative_timeout_secs == 0 {
            bail!("timeouts must be positive");
        }
        if self.stale_after_secs <= self.execution_timeout_secs {
            bail!(
                "stale_after_secs ({}) must exceed execution_timeout_secs ({})",
                self.stale_after_secs,
                self.execution_timeout_secs
            );
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        if !self.negligible_return_pct.is_finite() || self.negligible_return_pct < 0.0 {
            bail!("negligible_return_pct must be a non-negative number");
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("database_url is not configured (set DATABASE_URL or BACKTESTQ_DATABASE_URL)")
    }

    pub fn engine_url(&self) -> Result<&str> {
        self.engine_url
            .as_deref()
            .context("engine_url is required to run workers (set BACKTESTQ_ENGINE_URL)")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn narrative_timeout(&self) -> Duration {
        Duration::from_secs(self.narrative_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_into<T>(value: Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = value {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))?;
    }
    Ok(())
}

fn variant_into<T: DeserializeOwned>(value: Option<String>, key: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = value {
        let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> = raw.trim().into_deserializer();
        *slot = T::deserialize(de).map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))?;
    }
    Ok(())
}
