//! Adjustment planning: `findings -> AdjustmentPlan | exhausted`.
//!
//! The orchestrator only sees [`AdjustmentStrategy`]; which decision procedure
//! backs it (rule table, model call, heuristic) does not change the state machine.

use async_trait::async_trait;

use backtestq_core::{
    Adjustment, AdjustmentPlan, AnalysisInput, AttemptRecord, Finding, ReasonCode,
};

/// Decision returned by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Adjust(AdjustmentPlan),
    /// No safe adjustment exists; `root` is the finding that could not be resolved.
    Exhausted { root: Finding },
}

#[async_trait]
pub trait AdjustmentStrategy: Send + Sync {
    /// Derive the next attempt's plan from ordered findings.
    ///
    /// Proposals must narrow the input; the orchestrator rejects those that do not.
    async fn plan(
        &self,
        findings: &[Finding],
        input: &AnalysisInput,
        history: &[AttemptRecord],
    ) -> PlanDecision;
}

/// Deterministic rule table.
///
/// - findings carrying a remedy contribute it
/// - execution failures halve the window, or drop the last symbol once the
///   window is already short
/// - zero-activity and direction findings clear indicator conditions, else
///   disable disclosures
/// - invalid input, missing subjects, unavailable coverage and out-of-domain
///   output are never adjustable
#[derive(Debug, Clone)]
pub struct RuleTablePlanner {
    min_window_days: i64,
}

impl Default for RuleTablePlanner {
    fn default() -> Self {
        Self { min_window_days: 30 }
    }
}

impl RuleTablePlanner {
    pub fn new(min_window_days: i64) -> Self {
        Self {
            min_window_days: min_window_days.max(1),
        }
    }

    fn is_terminal(code: ReasonCode) -> bool {
        matches!(
            code,
            ReasonCode::InvalidInput
                | ReasonCode::NoSubjects
                | ReasonCode::CoverageUnavailable
                | ReasonCode::OutOfDomain
                | ReasonCode::NonNarrowingAdjustment
                | ReasonCode::ArtifactWriteFailed
        )
    }

    fn fallback(&self, finding: &Finding, input: &AnalysisInput) -> Option<Adjustment> {
        match finding.code {
            ReasonCode::ExecutionFailed | ReasonCode::ExecutionTimeout => {
                let half = input.window_days() / 2;
                if half >= self.min_window_days {
                    Some(Adjustment::NarrowWindow {
                        start: input.start_date,
                        end: input.start_date + chrono::Duration::days(half - 1),
                    })
                } else if input.target_symbols.len() > 1 {
                    input.target_symbols.last().map(|s| Adjustment::DropSymbols {
                        symbols: vec![s.clone()],
                    })
                } else {
                    None
                }
            }
            ReasonCode::ZeroActivityWithReturn | ReasonCode::DirectionMismatch => {
                if !input.event_indicator_conditions.is_empty() {
                    Some(Adjustment::ClearIndicatorConditions)
                } else if input.use_dart_disclosure {
                    Some(Adjustment::DisableDisclosures)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl AdjustmentStrategy for RuleTablePlanner {
    async fn plan(
        &self,
        findings: &[Finding],
        input: &AnalysisInput,
        _history: &[AttemptRecord],
    ) -> PlanDecision {
        let Some(root) = findings.first() else {
            return PlanDecision::Exhausted {
                root: Finding::blocking(ReasonCode::NonNarrowingAdjustment, "no findings to act on"),
            };
        };

        if let Some(terminal) = findings.iter().find(|f| f.is_blocking() && Self::is_terminal(f.code)) {
            return PlanDecision::Exhausted {
                root: terminal.clone(),
            };
        }

        let mut changes: Vec<Adjustment> = Vec::new();
        let mut dropped: Vec<String> = Vec::new();
        for finding in findings {
            let change = finding.remedy.clone().or_else(|| self.fallback(finding, input));
            match change {
                Some(Adjustment::DropSymbols { symbols }) => {
                    for symbol in symbols {
                        if !dropped.contains(&symbol) {
                            dropped.push(symbol);
                        }
                    }
                }
                Some(other) => {
                    if !changes.contains(&other) {
                        changes.push(other);
                    }
                }
                None => {}
            }
        }
        if !dropped.is_empty() {
            dropped.sort();
            changes.push(Adjustment::DropSymbols { symbols: dropped });
        }

        let rationale = findings.iter().map(Finding::summary).collect::<Vec<_>>().join("; ");
        let plan = AdjustmentPlan::new(root.code, changes).with_rationale(rationale);
        let next = plan.apply(input);

        if next == *input {
            return PlanDecision::Exhausted { root: root.clone() };
        }
        if next.target_symbols.is_empty() && !input.target_symbols.is_empty() {
            return PlanDecision::Exhausted { root: root.clone() };
        }

        PlanDecision::Adjust(plan)
    }
}
