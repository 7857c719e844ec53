//! The job row and its lifecycle vocabulary.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::history::AttemptRecord;
use crate::id::{JobId, LeaseToken};
use crate::input::AnalysisInput;
use crate::output::{AnalysisOutput, Narrative};

/// Default retry ceiling for new jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Primary job status. Single source of truth for ownership and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Exclusively owned by one worker.
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` admit no further mutation.
    pub fn is_absorbing(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Status of the secondary (narrative) path. Never gates the primary status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// No narrative collaborator configured.
    Skipped,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "running" => Ok(AnalysisStatus::Running),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            "skipped" => Ok(AnalysisStatus::Skipped),
            other => Err(DomainError::validation(format!("unknown analysis status: {other}"))),
        }
    }
}

/// Secondary analysis block, written only by the narrative path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBlock {
    pub status: AnalysisStatus,
    pub output: Option<Narrative>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
}

/// Where the result artifacts of a completed job were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub result_path: String,
    #[serde(default)]
    pub report_path: Option<String>,
}

/// Proof of ownership over an `in_progress` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub job_id: JobId,
    pub token: LeaseToken,
}

/// A row as created by the submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub input: JsonValue,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(input: JsonValue) -> Self {
        Self {
            id: JobId::new(),
            input,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Build from a typed input.
    pub fn from_input(input: &AnalysisInput) -> DomainResult<Self> {
        let value = serde_json::to_value(input)
            .map_err(|e| DomainError::validation(format!("failed to encode input: {e}")))?;
        Ok(Self::new(value))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Raw input document; decoded with [`Job::decode_input`].
    pub input: JsonValue,
    /// Written exactly once, at finalization as `completed`.
    pub output: Option<AnalysisOutput>,
    pub artifacts: Option<Artifacts>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set iff the job is `failed`.
    pub error_message: Option<String>,
    /// Present while the row is `in_progress`.
    pub lease: Option<LeaseToken>,
    pub history: Vec<AttemptRecord>,
    pub analysis: AnalysisBlock,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `pending` row.
    pub fn pending(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            status: JobStatus::Pending,
            input: new.input,
            output: None,
            artifacts: None,
            retry_count: 0,
            max_retries: new.max_retries,
            error_message: None,
            lease: None,
            history: Vec::new(),
            analysis: AnalysisBlock::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn decode_input(&self) -> DomainResult<AnalysisInput> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| DomainError::validation(format!("job input does not decode: {e}")))
    }

    /// The lease this row is currently held under, if any.
    pub fn lease(&self) -> Option<Lease> {
        self.lease.map(|token| Lease {
            job_id: self.id,
            token,
        })
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}
