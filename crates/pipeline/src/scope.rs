//! Narrowing check applied to every proposed adjustment.

use std::collections::BTreeSet;

use backtestq_core::{Adjustment, AnalysisInput, AttemptRecord, Finding, ReasonCode};

/// Symbols removed by any plan recorded in `history`.
pub fn eliminated_symbols(history: &[AttemptRecord]) -> BTreeSet<String> {
    history
        .iter()
        .filter_map(|r| r.plan.as_ref())
        .flat_map(|p| p.changes.iter())
        .filter_map(|c| match c {
            Adjustment::DropSymbols { symbols } => Some(symbols.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Verify that `next` strictly narrows `prev` and reintroduces nothing that an
/// earlier attempt eliminated.
///
/// An empty symbol list on `prev` means the full universe, so any explicit list
/// narrows it.
pub fn check_narrowing(
    prev: &AnalysisInput,
    next: &AnalysisInput,
    history: &[AttemptRecord],
) -> Result<(), Finding> {
    let reject = |detail: String| -> Result<(), Finding> {
        Err(Finding::blocking(ReasonCode::NonNarrowingAdjustment, detail))
    };

    if next == prev {
        return reject("proposed input is identical to the previous attempt".into());
    }

    if !prev.target_symbols.is_empty() {
        if next.target_symbols.is_empty() {
            return reject("proposed input widens to the full universe".into());
        }
        if let Some(added) = next.target_symbols.iter().find(|s| !prev.target_symbols.contains(s)) {
            return reject(format!("proposed input adds symbol {added}"));
        }
    }

    let eliminated = eliminated_symbols(history);
    if let Some(back) = next.target_symbols.iter().find(|s| eliminated.contains(*s)) {
        return reject(format!("proposed input reintroduces eliminated symbol {back}"));
    }

    if next.start_date < prev.start_date || next.end_date > prev.end_date {
        return reject(format!(
            "window {}..{} is not inside {}..{}",
            next.start_date, next.end_date, prev.start_date, prev.end_date
        ));
    }

    if next.use_dart_disclosure && !prev.use_dart_disclosure {
        return reject("proposed input re-enables disclosures".into());
    }

    if next
        .event_indicator_conditions
        .iter()
        .any(|c| !prev.event_indicator_conditions.contains(c))
    {
        return reject("proposed input adds indicator conditions".into());
    }

    if next.max_positions > prev.max_positions || next.max_portfolio_size > prev.max_portfolio_size {
        return reject("proposed input raises position caps".into());
    }

    if next.initial_cash != prev.initial_cash || next.rebalancing_period != prev.rebalancing_period {
        return reject("proposed input changes fields the planner may not touch".into());
    }

    Ok(())
}
