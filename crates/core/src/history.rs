//! Per-job attempt history (audit trail).

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::finding::{Finding, ReasonCode};
use crate::plan::AdjustmentPlan;

/// Pipeline stage that produced an attempt's findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    Execute,
    Audit,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Preflight => write!(f, "preflight"),
            Stage::Execute => write!(f, "execute"),
            Stage::Audit => write!(f, "audit"),
            Stage::Finalize => write!(f, "finalize"),
        }
    }
}

/// Record of one unsuccessful attempt.
///
/// `attempt` is the retry number the record led to (1 for the first retry). A
/// record with no plan closes the history of a job that was finalized as failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub stage: Stage,
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<AdjustmentPlan>,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(attempt: u32, stage: Stage, findings: Vec<Finding>) -> Self {
        Self {
            attempt,
            stage,
            findings,
            plan: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan: AdjustmentPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn has_code(&self, code: ReasonCode) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }
}
