//! `backtestq-core` — job queue domain records.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the job
//! row, its status machine vocabulary, the analysis input/output payloads, and the
//! findings and adjustment plans the pipeline exchanges between attempts.

pub mod error;
pub mod finding;
pub mod history;
pub mod id;
pub mod input;
pub mod job;
pub mod output;
pub mod plan;

pub use error::{DomainError, DomainResult};
pub use finding::{Finding, ReasonCode, Severity, sort_findings};
pub use history::{AttemptRecord, Stage};
pub use id::{JobId, LeaseToken};
pub use input::{AnalysisInput, RebalancingPeriod};
pub use job::{DEFAULT_MAX_RETRIES, AnalysisBlock, AnalysisStatus, Artifacts, Job, JobStatus, Lease, NewJob};
pub use output::{AnalysisOutput, Narrative, OutputSummary};
pub use plan::{Adjustment, AdjustmentPlan};
