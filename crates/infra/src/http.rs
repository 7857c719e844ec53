//! HTTP clients for the computation and narrative collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use backtestq_analysis::{AnalysisEngine, ExecutionError, NarrativeError, Narrator};
use backtestq_core::{AnalysisInput, AnalysisOutput, Narrative};

fn client() -> Result<Client, reqwest::Error> {
    Client::builder().connect_timeout(Duration::from_secs(10)).build()
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Computation engine behind `POST <base_url>/execute`.
///
/// The request body is the input document; the response body an
/// [`AnalysisOutput`]. Timeouts are enforced by the caller's adapter.
#[derive(Debug, Clone)]
pub struct HttpAnalysisEngine {
    client: Client,
    url: String,
}

impl HttpAnalysisEngine {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client()?,
            url: endpoint(base_url, "execute"),
        })
    }
}

#[async_trait]
impl AnalysisEngine for HttpAnalysisEngine {
    async fn execute(&self, input: &AnalysisInput) -> Result<AnalysisOutput, ExecutionError> {
        let response = self
            .client
            .post(&self.url)
            .json(input)
            .send()
            .await
            .map_err(|e| ExecutionError::Engine(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    ExecutionError::InvalidInput(format!("{}: {message}", status.as_u16()))
                }
                _ => ExecutionError::Engine(format!("{}: {message}", status.as_u16())),
            });
        }

        response
            .json::<AnalysisOutput>()
            .await
            .map_err(|e| ExecutionError::MalformedOutput(e.to_string()))
    }
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    input: &'a AnalysisInput,
    output: &'a AnalysisOutput,
}

/// Narrative generator behind `POST <base_url>/summarize`.
#[derive(Debug, Clone)]
pub struct HttpNarrator {
    client: Client,
    url: String,
}

impl HttpNarrator {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client()?,
            url: endpoint(base_url, "summarize"),
        })
    }
}

#[async_trait]
impl Narrator for HttpNarrator {
    async fn summarize(&self, input: &AnalysisInput, output: &AnalysisOutput) -> Result<Narrative, NarrativeError> {
        let response = self
            .client
            .post(&self.url)
            .json(&SummarizeRequest { input, output })
            .send()
            .await
            .map_err(|e| NarrativeError::Service(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(NarrativeError::Service(format!("{}: {message}", status.as_u16())));
        }

        response
            .json::<Narrative>()
            .await
            .map_err(|e| NarrativeError::Malformed(e.to_string()))
    }
}
