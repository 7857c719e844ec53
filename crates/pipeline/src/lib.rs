//! `backtestq-pipeline` — decision logic of the job state machine.
//!
//! Everything here is side-effect free apart from reading data coverage:
//!
//! - [`preflight`]: is the input worth executing?
//! - [`audit`]: is the execution's output internally consistent?
//! - [`planner`]: which narrower input should the next attempt use?
//! - [`scope`]: does a proposed input really narrow the previous one?
//! - [`state`]: which stage comes next, given a stage outcome and the retry budget?

pub mod audit;
pub mod planner;
pub mod preflight;
pub mod scope;
pub mod state;

pub use audit::{AdvisoryRecurrence, AuditConfig, AuditVerdict, Auditor};
pub use planner::{AdjustmentStrategy, PlanDecision, RuleTablePlanner};
pub use preflight::{CoverageSnapshot, Preflight, PreflightConfig, PreflightReport};
pub use scope::check_narrowing;
pub use state::{FinalStatus, Phase, RetryBudget, StageOutcome, StateMachine};
