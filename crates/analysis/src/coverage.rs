//! Data-availability contract consulted by preflight.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::CoverageError;

/// Availability of one symbol's rows inside a requested window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolCoverage {
    pub symbol: String,
    pub rows: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl SymbolCoverage {
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            rows: 0,
            first_date: None,
            last_date: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// Read-only view of which input data exists.
///
/// Both methods should return one entry per requested symbol, in request order,
/// with `rows == 0` for symbols that have nothing in the window. Preflight treats
/// a requested symbol with no entry as uncovered.
#[async_trait]
pub trait CoverageSource: Send + Sync {
    async fn price_coverage(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError>;

    async fn disclosure_coverage(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError>;
}

/// Fixed coverage table for tests and local runs.
///
/// Each symbol is available on every calendar day of its configured range.
#[derive(Debug, Clone, Default)]
pub struct StaticCoverageSource {
    prices: BTreeMap<String, (NaiveDate, NaiveDate)>,
    disclosures: BTreeMap<String, (NaiveDate, NaiveDate)>,
    unavailable: bool,
}

impl StaticCoverageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prices(mut self, symbol: impl Into<String>, first: NaiveDate, last: NaiveDate) -> Self {
        self.prices.insert(symbol.into(), (first, last));
        self
    }

    pub fn with_disclosures(mut self, symbol: impl Into<String>, first: NaiveDate, last: NaiveDate) -> Self {
        self.disclosures.insert(symbol.into(), (first, last));
        self
    }

    /// Make every query fail with [`CoverageError::Unavailable`].
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    fn lookup(
        &self,
        table: &BTreeMap<String, (NaiveDate, NaiveDate)>,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError> {
        if self.unavailable {
            return Err(CoverageError::Unavailable("static source marked unavailable".into()));
        }

        Ok(symbols
            .iter()
            .map(|symbol| match table.get(symbol) {
                Some((first, last)) => {
                    let from = (*first).max(start);
                    let to = (*last).min(end);
                    if from > to {
                        SymbolCoverage::empty(symbol.clone())
                    } else {
                        SymbolCoverage {
                            symbol: symbol.clone(),
                            rows: ((to - from).num_days() + 1) as u64,
                            first_date: Some(from),
                            last_date: Some(to),
                        }
                    }
                }
                None => SymbolCoverage::empty(symbol.clone()),
            })
            .collect())
    }
}

#[async_trait]
impl CoverageSource for StaticCoverageSource {
    async fn price_coverage(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError> {
        self.lookup(&self.prices, symbols, start, end)
    }

    async fn disclosure_coverage(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError> {
        self.lookup(&self.disclosures, symbols, start, end)
    }
}
