//! Write payloads accepted by the job store.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use backtestq_core::{AnalysisBlock, AnalysisOutput, AnalysisStatus, Artifacts, AttemptRecord, Narrative};

/// Revised input for another attempt.
#[derive(Debug, Clone)]
pub struct RetryUpdate {
    pub input: JsonValue,
    /// Must be exactly one more than the stored count.
    pub retry_count: u32,
    pub record: AttemptRecord,
    /// Hand the row back to the queue (`pending`) instead of keeping it.
    pub requeue: bool,
}

/// Successful finalization.
#[derive(Debug, Clone)]
pub struct Completion {
    pub output: AnalysisOutput,
    pub artifacts: Option<Artifacts>,
}

/// Failed finalization.
#[derive(Debug, Clone)]
pub struct Failure {
    /// Leads with the root finding's reason code.
    pub error_message: String,
    /// Final retry count; may be one above the stored count when the last retry
    /// was spent on a plan that turned out to be exhausted.
    pub retry_count: u32,
    pub record: AttemptRecord,
}

/// Transition of the secondary analysis block.
#[derive(Debug, Clone)]
pub enum AnalysisUpdate {
    Running,
    Completed { narrative: Narrative, elapsed_ms: u64 },
    Failed { error: String, elapsed_ms: u64 },
    Skipped,
}

impl AnalysisUpdate {
    pub fn status(&self) -> AnalysisStatus {
        match self {
            AnalysisUpdate::Running => AnalysisStatus::Running,
            AnalysisUpdate::Completed { .. } => AnalysisStatus::Completed,
            AnalysisUpdate::Failed { .. } => AnalysisStatus::Failed,
            AnalysisUpdate::Skipped => AnalysisStatus::Skipped,
        }
    }

    /// Apply to an in-memory block.
    pub fn apply_to(&self, block: &mut AnalysisBlock, now: DateTime<Utc>) {
        block.status = self.status();
        match self {
            AnalysisUpdate::Running => {
                block.started_at = Some(now);
                block.error = None;
            }
            AnalysisUpdate::Completed { narrative, elapsed_ms } => {
                block.output = Some(narrative.clone());
                block.error = None;
                block.completed_at = Some(now);
                block.elapsed_ms = Some(*elapsed_ms);
            }
            AnalysisUpdate::Failed { error, elapsed_ms } => {
                block.error = Some(error.clone());
                block.completed_at = Some(now);
                block.elapsed_ms = Some(*elapsed_ms);
            }
            AnalysisUpdate::Skipped => {}
        }
    }
}

/// Row counts per primary status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}
