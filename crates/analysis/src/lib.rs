//! `backtestq-analysis`
//!
//! **Responsibility:** boundary to the collaborators the queue core does not own.
//!
//! This crate is intentionally **not** part of the job state machine:
//! - It must not touch the job store.
//! - The computation collaborator is a deterministic function `input -> output`.
//! - The narrative collaborator runs only after a job completed and its failures
//!   never reach the primary job status.

pub mod coverage;
pub mod engine;
pub mod error;
pub mod narrative;

pub use coverage::{CoverageSource, StaticCoverageSource, SymbolCoverage};
pub use engine::{AnalysisEngine, EngineAdapter};
pub use error::{CoverageError, ExecutionError, NarrativeError};
pub use narrative::{NarrativeAdapter, Narrator, SecretGuard};
