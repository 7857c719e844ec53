use std::time::Duration;

use thiserror::Error;

use backtestq_core::{Finding, ReasonCode};

/// Failure of the computation collaborator, as seen by the core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("engine rejected input: {0}")]
    InvalidInput(String),

    #[error("engine failed: {0}")]
    Engine(String),

    #[error("engine returned malformed output: {0}")]
    MalformedOutput(String),

    #[error("engine did not finish within {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ExecutionError::Timeout(_) => ReasonCode::ExecutionTimeout,
            _ => ReasonCode::ExecutionFailed,
        }
    }

    /// The implicit blocking finding an execution failure stands for.
    pub fn to_finding(&self) -> Finding {
        Finding::blocking(self.reason_code(), self.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NarrativeError {
    #[error("narrative service failed: {0}")]
    Service(String),

    #[error("narrative service returned malformed output: {0}")]
    Malformed(String),

    #[error("narrative did not finish within {0:?}")]
    Timeout(Duration),

    #[error("narrative rejected by guardrail: contains {0}")]
    SecretLeak(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoverageError {
    #[error("coverage source unavailable: {0}")]
    Unavailable(String),
}
