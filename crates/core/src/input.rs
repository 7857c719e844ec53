//! Structured parameters handed to the computation collaborator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Upper bound for `max_positions` after normalization.
pub const MAX_POSITIONS_CAP: u32 = 20;
/// Upper bound for `max_portfolio_size` after normalization.
pub const MAX_PORTFOLIO_SIZE_CAP: u32 = 50;

/// How often the simulated portfolio is rebalanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalancingPeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
}

/// Input of one analysis job.
///
/// Field names match the JSON the submitter writes into the job row and the JSON
/// the computation collaborator expects, so the same document flows end to end.
/// Only the adjustment planner rewrites it, between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInput {
    #[serde(default)]
    pub target_symbols: Vec<String>,
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    #[serde(default = "default_end_date")]
    pub end_date: NaiveDate,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: f64,
    #[serde(default)]
    pub rebalancing_period: RebalancingPeriod,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    #[serde(default = "default_max_portfolio_size")]
    pub max_portfolio_size: u32,
    #[serde(default = "default_true")]
    pub use_dart_disclosure: bool,
    #[serde(default)]
    pub event_indicator_conditions: Vec<serde_json::Value>,
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default()
}

fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default()
}

fn default_initial_cash() -> f64 {
    100_000_000.0
}

fn default_max_positions() -> u32 {
    10
}

fn default_max_portfolio_size() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for AnalysisInput {
    fn default() -> Self {
        Self {
            target_symbols: Vec::new(),
            start_date: default_start_date(),
            end_date: default_end_date(),
            initial_cash: default_initial_cash(),
            rebalancing_period: RebalancingPeriod::default(),
            max_positions: default_max_positions(),
            max_portfolio_size: default_max_portfolio_size(),
            use_dart_disclosure: true,
            event_indicator_conditions: Vec::new(),
        }
    }
}

impl AnalysisInput {
    pub fn for_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_symbols: symbols.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_window(mut self, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        self.start_date = start_date;
        self.end_date = end_date;
        self
    }

    /// Apply the deterministic guardrails.
    ///
    /// - symbols are trimmed, restricted to 6-digit codes, de-duplicated and sorted
    /// - a reversed window is swapped
    /// - `max_positions` is clamped to `1..=20`, `max_portfolio_size` to `1..=50`
    ///
    /// Idempotent: `x.normalized().normalized() == x.normalized()`.
    pub fn normalized(mut self) -> Self {
        let mut symbols: Vec<String> = self
            .target_symbols
            .iter()
            .map(|s| s.trim())
            .filter(|s| is_symbol_code(s))
            .map(str::to_string)
            .collect();
        symbols.sort();
        symbols.dedup();
        self.target_symbols = symbols;

        if self.start_date > self.end_date {
            std::mem::swap(&mut self.start_date, &mut self.end_date);
        }

        self.max_positions = self.max_positions.clamp(1, MAX_POSITIONS_CAP);
        self.max_portfolio_size = self.max_portfolio_size.clamp(1, MAX_PORTFOLIO_SIZE_CAP);
        self
    }

    /// Inclusive length of the requested window in days.
    pub fn window_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }
}

fn is_symbol_code(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}
