//! Adjustment plans: the diff applied to a job input between attempts.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::finding::ReasonCode;
use crate::input::AnalysisInput;

/// One change to an [`AnalysisInput`].
///
/// Every variant can only shrink the input: windows are intersected, symbols
/// removed, filters cleared, caps lowered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    /// Intersect the window with `start..=end`.
    NarrowWindow { start: NaiveDate, end: NaiveDate },
    DropSymbols { symbols: Vec<String> },
    ClearIndicatorConditions,
    DisableDisclosures,
    /// Lower `max_positions` to at most this value.
    CapPositions { max_positions: u32 },
}

impl Adjustment {
    /// Apply this change in place.
    ///
    /// A window narrowing that would leave an empty window is ignored.
    pub fn apply_to(&self, input: &mut AnalysisInput) {
        match self {
            Adjustment::NarrowWindow { start, end } => {
                let start = input.start_date.max(*start);
                let end = input.end_date.min(*end);
                if start <= end {
                    input.start_date = start;
                    input.end_date = end;
                }
            }
            Adjustment::DropSymbols { symbols } => {
                input.target_symbols.retain(|s| !symbols.contains(s));
            }
            Adjustment::ClearIndicatorConditions => input.event_indicator_conditions.clear(),
            Adjustment::DisableDisclosures => input.use_dart_disclosure = false,
            Adjustment::CapPositions { max_positions } => {
                input.max_positions = input.max_positions.min(*max_positions);
            }
        }
    }
}

/// A revised input derived from findings.
///
/// Plans are ephemeral: they only outlive their attempt inside the job's
/// attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentPlan {
    /// Reason code of the finding that motivated the plan.
    pub reason: ReasonCode,
    pub changes: Vec<Adjustment>,
    #[serde(default)]
    pub rationale: String,
}

impl AdjustmentPlan {
    pub fn new(reason: ReasonCode, changes: Vec<Adjustment>) -> Self {
        Self {
            reason,
            changes,
            rationale: String::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// Produce the next attempt's input. The result is normalized.
    pub fn apply(&self, input: &AnalysisInput) -> AnalysisInput {
        let mut next = input.clone();
        for change in &self.changes {
            change.apply_to(&mut next);
        }
        next.normalized()
    }
}
