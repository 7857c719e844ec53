use std::fmt;

use backtestq_core::JobStatus;

/// Terminal status chosen on entering `Finalizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Completed,
    Failed,
}

impl From<FinalStatus> for JobStatus {
    fn from(value: FinalStatus) -> Self {
        match value {
            FinalStatus::Completed => JobStatus::Completed,
            FinalStatus::Failed => JobStatus::Failed,
        }
    }
}

/// Stages of one job's processing by an orchestrator.
///
/// Claimed → Preflighting → Executing → Auditing → {Retrying → Preflighting | Finalizing} → Done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Claimed,
    Preflighting,
    Executing,
    Auditing,
    Retrying,
    Finalizing(FinalStatus),
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Claimed => write!(f, "CLAIMED"),
            Phase::Preflighting => write!(f, "PREFLIGHTING"),
            Phase::Executing => write!(f, "EXECUTING"),
            Phase::Auditing => write!(f, "AUDITING"),
            Phase::Retrying => write!(f, "RETRYING"),
            Phase::Finalizing(FinalStatus::Completed) => write!(f, "FINALIZING(completed)"),
            Phase::Finalizing(FinalStatus::Failed) => write!(f, "FINALIZING(failed)"),
            Phase::Done => write!(f, "DONE"),
        }
    }
}

/// What a stage reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Preflight ok, execution succeeded, audit passed, or a plan was accepted.
    Ok,
    /// A finding another attempt may fix.
    RetryEligible,
    /// Nothing more can be done: recurring finding, exhausted planner, rejected plan.
    Terminal,
}

/// Shared retry ceiling across all stages of one job's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(used: u32, max: u32) -> Self {
        Self { used, max }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn can_retry(&self) -> bool {
        self.used < self.max
    }

    /// Spend one retry, returning the new retry count.
    ///
    /// Returns `None` (and spends nothing) once the ceiling is reached.
    pub fn consume(&mut self) -> Option<u32> {
        if !self.can_retry() {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }
}

/// Pure transition function of the orchestrator.
pub struct StateMachine;

impl StateMachine {
    /// Compute the phase that follows `phase` given the stage's `outcome`.
    ///
    /// - A retry-eligible outcome leads to `Retrying` only while the budget has
    ///   room; otherwise the job is finalized as failed.
    /// - `Retrying` consumes budget before it is entered, so its own `Ok` outcome
    ///   (an accepted plan) always loops back to `Preflighting`.
    /// - `Finalizing` always ends in `Done`, which is absorbing.
    pub fn next(phase: Phase, outcome: StageOutcome, budget: &RetryBudget) -> Phase {
        let retry_or_fail = || {
            if budget.can_retry() {
                Phase::Retrying
            } else {
                Phase::Finalizing(FinalStatus::Failed)
            }
        };

        match phase {
            Phase::Claimed => Phase::Preflighting,
            Phase::Preflighting => match outcome {
                StageOutcome::Ok => Phase::Executing,
                StageOutcome::RetryEligible => retry_or_fail(),
                StageOutcome::Terminal => Phase::Finalizing(FinalStatus::Failed),
            },
            Phase::Executing => match outcome {
                StageOutcome::Ok => Phase::Auditing,
                StageOutcome::RetryEligible => retry_or_fail(),
                StageOutcome::Terminal => Phase::Finalizing(FinalStatus::Failed),
            },
            Phase::Auditing => match outcome {
                StageOutcome::Ok => Phase::Finalizing(FinalStatus::Completed),
                StageOutcome::RetryEligible => retry_or_fail(),
                StageOutcome::Terminal => Phase::Finalizing(FinalStatus::Failed),
            },
            Phase::Retrying => match outcome {
                StageOutcome::Ok => Phase::Preflighting,
                StageOutcome::RetryEligible | StageOutcome::Terminal => {
                    Phase::Finalizing(FinalStatus::Failed)
                }
            },
            Phase::Finalizing(_) | Phase::Done => Phase::Done,
        }
    }
}
