//! Computation collaborator contract and its timeout-enforcing adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use backtestq_core::{AnalysisInput, AnalysisOutput};

use crate::error::ExecutionError;

/// The deterministic computation collaborator.
///
/// Implementations must return the same output for the same input; the retry
/// planner reasons about inputs on that assumption. CPU-bound engines should move
/// their work off the async runtime (e.g. `spawn_blocking`) so that the adapter's
/// timeout can fire.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn execute(&self, input: &AnalysisInput) -> Result<AnalysisOutput, ExecutionError>;
}

/// Wraps an [`AnalysisEngine`] with a hard timeout.
///
/// On timeout the in-flight call is dropped, which releases whatever the engine
/// future owns, and the caller receives [`ExecutionError::Timeout`].
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn AnalysisEngine>,
    timeout: Duration,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn AnalysisEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, input: &AnalysisInput) -> Result<AnalysisOutput, ExecutionError> {
        match tokio::time::timeout(self.timeout, self.engine.execute(input)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "analysis engine timed out");
                Err(ExecutionError::Timeout(self.timeout))
            }
        }
    }
}
