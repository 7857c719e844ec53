//! Narrative collaborator contract, its adapter and the output guardrail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use backtestq_core::{AnalysisInput, AnalysisOutput, Narrative};

use crate::error::NarrativeError;

/// Turns a completed analysis into prose.
///
/// Invoked only after the job was finalized as completed. Must not mutate any
/// job state.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn summarize(
        &self,
        input: &AnalysisInput,
        output: &AnalysisOutput,
    ) -> Result<Narrative, NarrativeError>;
}

/// Rejects narratives that echo credentials.
///
/// Generated text is stored and shown to submitters; an API key or a database
/// URL appearing in it is treated as a narrative failure.
#[derive(Debug, Clone)]
pub struct SecretGuard {
    patterns: Vec<(&'static str, Regex)>,
}

impl SecretGuard {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: vec![
                ("an api key", Regex::new(r"\bsk-[A-Za-z0-9]{10,}\b")?),
                (
                    "a database url",
                    Regex::new(r"(?i)\bpostgres(?:ql)?(?:\+\w+)?://\S+")?,
                ),
            ],
        })
    }

    pub fn check(&self, text: &str) -> Result<(), NarrativeError> {
        for (label, pattern) in &self.patterns {
            if pattern.is_match(text) {
                return Err(NarrativeError::SecretLeak((*label).to_string()));
            }
        }
        Ok(())
    }

    pub fn check_narrative(&self, narrative: &Narrative) -> Result<(), NarrativeError> {
        self.check(&narrative.markdown)?;
        if !narrative.structured.is_null() {
            self.check(&narrative.structured.to_string())?;
        }
        Ok(())
    }
}

/// Wraps a [`Narrator`] with a timeout and the [`SecretGuard`].
#[derive(Clone)]
pub struct NarrativeAdapter {
    narrator: Arc<dyn Narrator>,
    timeout: Duration,
    guard: SecretGuard,
}

impl NarrativeAdapter {
    pub fn new(narrator: Arc<dyn Narrator>, timeout: Duration, guard: SecretGuard) -> Self {
        Self {
            narrator,
            timeout,
            guard,
        }
    }

    pub async fn summarize(
        &self,
        input: &AnalysisInput,
        output: &AnalysisOutput,
    ) -> Result<Narrative, NarrativeError> {
        let narrative = tokio::time::timeout(self.timeout, self.narrator.summarize(input, output))
            .await
            .map_err(|_| NarrativeError::Timeout(self.timeout))??;

        if let Err(e) = self.guard.check_narrative(&narrative) {
            warn!(error = %e, "narrative blocked by guardrail");
            return Err(e);
        }
        Ok(narrative)
    }
}
