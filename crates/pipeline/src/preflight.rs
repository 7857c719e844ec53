//! Preflight: check that the requested data exists before paying for execution.
//!
//! Evaluation is split in two:
//!
//! 1. [`Preflight::check`] gathers a [`CoverageSnapshot`] from a [`CoverageSource`]
//! 2. [`evaluate`] turns `(input, snapshot)` into an ordered list of findings
//!
//! `evaluate` is a pure function, so re-running preflight on an unchanged input
//! against unchanged data yields the same findings.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use backtestq_analysis::{CoverageSource, SymbolCoverage};
use backtestq_core::{Adjustment, AnalysisInput, Finding, ReasonCode, sort_findings};

/// Preflight policy.
#[derive(Debug, Clone, Default)]
pub struct PreflightConfig {
    /// Accept an empty symbol list as "the whole universe".
    pub allow_full_universe: bool,
}

/// Coverage facts preflight evaluates against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageSnapshot {
    pub prices: Vec<SymbolCoverage>,
    /// `None` when disclosures were not requested.
    pub disclosures: Option<Vec<SymbolCoverage>>,
}

/// Outcome of a preflight run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreflightReport {
    /// Blocking findings first.
    pub findings: Vec<Finding>,
    /// Window every covered symbol has data for, when it differs from the request.
    pub suggested_window: Option<(NaiveDate, NaiveDate)>,
}

impl PreflightReport {
    /// `true` when no finding blocks execution. Advisory findings may remain.
    pub fn is_ok(&self) -> bool {
        !self.findings.iter().any(Finding::is_blocking)
    }
}

/// Evaluate an input against a coverage snapshot.
pub fn evaluate(
    input: &AnalysisInput,
    snapshot: &CoverageSnapshot,
    config: &PreflightConfig,
) -> PreflightReport {
    let mut report = PreflightReport::default();

    if input.target_symbols.is_empty() {
        if !config.allow_full_universe {
            report.findings.push(Finding::blocking(
                ReasonCode::NoSubjects,
                "no target symbols requested and full-universe runs are disabled",
            ));
        }
        return report;
    }

    // A requested symbol the source did not report on counts as uncovered.
    let mut covered: Vec<&SymbolCoverage> = Vec::with_capacity(input.target_symbols.len());
    for symbol in &input.target_symbols {
        match lookup(&snapshot.prices, symbol) {
            Some(coverage) => covered.push(coverage),
            None => report.findings.push(
                Finding::blocking(
                    ReasonCode::MissingPriceData,
                    format!(
                        "no price rows for {symbol} between {} and {}",
                        input.start_date, input.end_date
                    ),
                )
                .with_subject(symbol.clone())
                .with_remedy(Adjustment::DropSymbols {
                    symbols: vec![symbol.clone()],
                }),
            ),
        }
    }

    let common_start = covered.iter().filter_map(|c| c.first_date).max();
    let common_end = covered.iter().filter_map(|c| c.last_date).min();

    if let (Some(start), Some(end)) = (common_start, common_end) {
        if start > end {
            // The symbol whose data starts last is the one that cannot overlap.
            let latest = covered
                .iter()
                .filter(|c| c.first_date == Some(start))
                .map(|c| c.symbol.clone())
                .max();
            let mut finding = Finding::blocking(
                ReasonCode::NoCommonWindow,
                format!("covered ranges do not overlap (latest start {start}, earliest end {end})"),
            );
            if let Some(symbol) = latest {
                finding = finding.with_subject(symbol.clone()).with_remedy(Adjustment::DropSymbols {
                    symbols: vec![symbol],
                });
            }
            report.findings.push(finding);
        } else if start > input.start_date || end < input.end_date {
            report.suggested_window = Some((start, end));
            report.findings.push(
                Finding::advisory(
                    ReasonCode::PartialCoverage,
                    format!(
                        "data covers {start}..{end} of the requested {}..{}",
                        input.start_date, input.end_date
                    ),
                )
                .with_remedy(Adjustment::NarrowWindow { start, end }),
            );
        }
    }

    if input.use_dart_disclosure {
        if let Some(disclosures) = &snapshot.disclosures {
            for symbol in input.target_symbols.iter().filter(|s| lookup(disclosures, s).is_none()) {
                report.findings.push(
                    Finding::advisory(
                        ReasonCode::MissingDisclosureData,
                        format!("no disclosures for {symbol} inside the window"),
                    )
                    .with_subject(symbol.clone())
                    .with_remedy(Adjustment::DisableDisclosures),
                );
            }
        }
    }

    sort_findings(&mut report.findings);
    report
}

/// Non-empty coverage reported for `symbol`.
fn lookup<'a>(coverage: &'a [SymbolCoverage], symbol: &str) -> Option<&'a SymbolCoverage> {
    coverage.iter().find(|c| c.symbol == symbol && !c.is_empty())
}

/// Preflight checker bound to a coverage source.
#[derive(Clone)]
pub struct Preflight {
    source: Arc<dyn CoverageSource>,
    config: PreflightConfig,
}

impl Preflight {
    pub fn new(source: Arc<dyn CoverageSource>, config: PreflightConfig) -> Self {
        Self { source, config }
    }

    /// Gather coverage and evaluate. Never mutates persisted state.
    ///
    /// A failing coverage source is reported as a blocking
    /// [`ReasonCode::CoverageUnavailable`] finding.
    pub async fn check(&self, input: &AnalysisInput) -> PreflightReport {
        match self.snapshot(input).await {
            Ok(snapshot) => {
                let report = evaluate(input, &snapshot, &self.config);
                debug!(findings = report.findings.len(), ok = report.is_ok(), "preflight evaluated");
                report
            }
            Err(e) => PreflightReport {
                findings: vec![Finding::blocking(ReasonCode::CoverageUnavailable, e.to_string())],
                suggested_window: None,
            },
        }
    }

    async fn snapshot(
        &self,
        input: &AnalysisInput,
    ) -> Result<CoverageSnapshot, backtestq_analysis::CoverageError> {
        if input.target_symbols.is_empty() {
            return Ok(CoverageSnapshot::default());
        }

        let prices = self
            .source
            .price_coverage(&input.target_symbols, input.start_date, input.end_date)
            .await?;
        let disclosures = if input.use_dart_disclosure {
            Some(
                self.source
                    .disclosure_coverage(&input.target_symbols, input.start_date, input.end_date)
                    .await?,
            )
        } else {
            None
        };

        Ok(CoverageSnapshot { prices, disclosures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backtestq_analysis::StaticCoverageSource;
    use backtestq_core::Severity;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn covered(symbol: &str, first: NaiveDate, last: NaiveDate) -> SymbolCoverage {
        SymbolCoverage {
            symbol: symbol.to_string(),
            rows: ((last - first).num_days() + 1) as u64,
            first_date: Some(first),
            last_date: Some(last),
        }
    }

    fn year_input(symbols: &[&str]) -> AnalysisInput {
        AnalysisInput::for_symbols(symbols.iter().copied()).with_window(date(2024, 1, 1), date(2024, 12, 31))
    }

    #[test]
    fn fully_covered_input_is_ok() {
        let input = year_input(&["005930"]);
        let snapshot = CoverageSnapshot {
            prices: vec![covered("005930", date(2024, 1, 1), date(2024, 12, 31))],
            disclosures: Some(vec![covered("005930", date(2024, 2, 1), date(2024, 11, 1))]),
        };

        let report = evaluate(&input, &snapshot, &PreflightConfig::default());

        assert!(report.is_ok());
        assert!(report.findings.is_empty());
        assert_eq!(report.suggested_window, None);
    }

    #[test]
    fn missing_symbol_is_always_blocking() {
        let input = year_input(&["000660", "005930"]);
        let snapshot = CoverageSnapshot {
            prices: vec![
                SymbolCoverage::empty("000660"),
                covered("005930", date(2024, 1, 1), date(2024, 12, 31)),
            ],
            disclosures: None,
        };

        let report = evaluate(&input, &snapshot, &PreflightConfig::default());

        assert!(!report.is_ok());
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.code, ReasonCode::MissingPriceData);
        assert_eq!(finding.severity, Severity::Blocking);
        assert_eq!(
            finding.remedy,
            Some(Adjustment::DropSymbols {
                symbols: vec!["000660".into()]
            })
        );
    }

    #[test]
    fn symbol_absent_from_snapshot_is_blocking() {
        let input = year_input(&["000660", "005930"]);
        let snapshot = CoverageSnapshot {
            prices: vec![covered("005930", date(2024, 1, 1), date(2024, 12, 31))],
            disclosures: Some(vec![covered("005930", date(2024, 1, 1), date(2024, 12, 31))]),
        };

        let report = evaluate(&input, &snapshot, &PreflightConfig::default());

        assert!(!report.is_ok());
        let blocking: Vec<&Finding> = report.findings.iter().filter(|f| f.is_blocking()).collect();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].code, ReasonCode::MissingPriceData);
        assert_eq!(blocking[0].subject.as_deref(), Some("000660"));
        assert_eq!(
            blocking[0].remedy,
            Some(Adjustment::DropSymbols {
                symbols: vec!["000660".into()]
            })
        );

        // Unrequested symbols in the snapshot are ignored.
        let extra = CoverageSnapshot {
            prices: vec![
                covered("005930", date(2024, 1, 1), date(2024, 12, 31)),
                SymbolCoverage::empty("035420"),
            ],
            disclosures: None,
        };
        assert!(evaluate(&year_input(&["005930"]), &extra, &PreflightConfig::default()).is_ok());
    }

    #[test]
    fn empty_symbol_list_depends_on_full_universe_flag() {
        let input = year_input(&[]);
        let snapshot = CoverageSnapshot::default();

        let strict = evaluate(&input, &snapshot, &PreflightConfig::default());
        assert_eq!(strict.findings[0].code, ReasonCode::NoSubjects);

        let open = evaluate(
            &input,
            &snapshot,
            &PreflightConfig {
                allow_full_universe: true,
            },
        );
        assert!(open.is_ok());
    }

    #[test]
    fn partial_coverage_suggests_common_window() {
        let input = year_input(&["000660", "005930"]);
        let snapshot = CoverageSnapshot {
            prices: vec![
                covered("000660", date(2024, 3, 1), date(2024, 12, 31)),
                covered("005930", date(2024, 1, 1), date(2024, 10, 31)),
            ],
            disclosures: None,
        };

        let report = evaluate(&input, &snapshot, &PreflightConfig::default());

        assert!(report.is_ok());
        assert_eq!(report.suggested_window, Some((date(2024, 3, 1), date(2024, 10, 31))));
        assert_eq!(report.findings[0].code, ReasonCode::PartialCoverage);
        assert_eq!(report.findings[0].severity, Severity::Advisory);
    }

    #[test]
    fn disjoint_coverage_blocks_and_drops_latest_symbol() {
        let input = year_input(&["000660", "005930"]);
        let snapshot = CoverageSnapshot {
            prices: vec![
                covered("000660", date(2024, 9, 1), date(2024, 12, 31)),
                covered("005930", date(2024, 1, 1), date(2024, 3, 31)),
            ],
            disclosures: None,
        };

        let report = evaluate(&input, &snapshot, &PreflightConfig::default());

        assert!(!report.is_ok());
        assert_eq!(report.findings[0].code, ReasonCode::NoCommonWindow);
        assert_eq!(report.findings[0].subject.as_deref(), Some("000660"));
    }

    #[test]
    fn missing_disclosures_are_advisory() {
        let input = year_input(&["005930"]);
        let snapshot = CoverageSnapshot {
            prices: vec![covered("005930", date(2024, 1, 1), date(2024, 12, 31))],
            disclosures: Some(vec![SymbolCoverage::empty("005930")]),
        };

        let report = evaluate(&input, &snapshot, &PreflightConfig::default());

        assert!(report.is_ok());
        assert_eq!(report.findings[0].code, ReasonCode::MissingDisclosureData);
        assert_eq!(report.findings[0].remedy, Some(Adjustment::DisableDisclosures));
    }

    #[tokio::test]
    async fn unavailable_source_blocks() {
        let preflight = Preflight::new(Arc::new(StaticCoverageSource::unavailable()), PreflightConfig::default());

        let report = preflight.check(&year_input(&["005930"])).await;

        assert!(!report.is_ok());
        assert_eq!(report.findings[0].code, ReasonCode::CoverageUnavailable);
    }

    #[tokio::test]
    async fn disclosures_are_not_queried_when_disabled() {
        let source = StaticCoverageSource::new().with_prices("005930", date(2020, 1, 1), date(2025, 12, 31));
        let preflight = Preflight::new(Arc::new(source), PreflightConfig::default());
        let mut input = year_input(&["005930"]);
        input.use_dart_disclosure = false;

        let report = preflight.check(&input).await;

        assert!(report.findings.is_empty());
    }

    fn arb_coverage() -> impl Strategy<Value = Vec<SymbolCoverage>> {
        proptest::collection::vec((0u32..4, 0i64..400, 0i64..400, any::<bool>()), 0..5).prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (_, a, b, present))| {
                    let symbol = format!("{:06}", i);
                    if present {
                        let base = date(2024, 1, 1);
                        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                        covered(&symbol, base + chrono::Duration::days(lo), base + chrono::Duration::days(hi))
                    } else {
                        SymbolCoverage::empty(symbol)
                    }
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn evaluation_is_idempotent(prices in arb_coverage(), use_disclosures in any::<bool>()) {
            let symbols: Vec<String> = prices.iter().map(|c| c.symbol.clone()).collect();
            let mut input = AnalysisInput::for_symbols(symbols).with_window(date(2024, 1, 1), date(2024, 12, 31));
            input.use_dart_disclosure = use_disclosures;
            let snapshot = CoverageSnapshot {
                disclosures: Some(prices.clone()),
                prices,
            };
            let config = PreflightConfig::default();

            let first = evaluate(&input, &snapshot, &config);
            let second = evaluate(&input, &snapshot, &config);
            prop_assert_eq!(&first, &second);

            // blocking findings always precede advisory ones
            let first_advisory = first.findings.iter().position(|f| !f.is_blocking()).unwrap_or(first.findings.len());
            prop_assert!(first.findings[first_advisory..].iter().all(|f| !f.is_blocking()));
        }
    }
}
