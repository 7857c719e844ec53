//! The analysis job queue.
//!
//! ## Components
//!
//! - [`JobStore`]: durable job table with atomic claim and lease-guarded writes
//!   ([`InMemoryJobStore`], [`PgJobStore`])
//! - [`Orchestrator`]: drives one claimed job through
//!   preflight → execute → audit → retry/finalize
//! - [`WorkerPool`]: independent poll loops sharing only the store
//! - [`StaleJobSweeper`]: returns stranded `in_progress` rows to `pending`

pub mod orchestrator;
pub mod postgres;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use orchestrator::{JobOutcome, Orchestrator, OrchestratorError, ProcessReport, RetryMode};
pub use postgres::PgJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use sweeper::{StaleJobSweeper, SweeperHandle};
pub use types::{AnalysisUpdate, Completion, Failure, JobStats, RetryUpdate};
pub use worker::{WorkerError, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats, poll_once};
