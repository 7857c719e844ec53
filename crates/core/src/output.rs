//! Results produced by the collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Headline metrics of one analysis run.
///
/// Percent fields (`total_return`, `annualized_return`, `mdd`, `win_rate`) are in
/// percent, not fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSummary {
    pub total_return: f64,
    pub annualized_return: f64,
    /// Maximum drawdown, `0..=100`.
    pub mdd: f64,
    pub sharpe_ratio: f64,
    /// Share of winning trades, `0..=100`.
    pub win_rate: f64,
    pub total_trades: u64,
    pub total_profit: f64,
    pub total_loss: f64,
}

impl OutputSummary {
    /// Realised profit net of realised loss.
    pub fn net_profit(&self) -> f64 {
        self.total_profit - self.total_loss
    }
}

/// Full output of the computation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    #[serde(flatten)]
    pub summary: OutputSummary,
    #[serde(default)]
    pub cumulative_return: Option<f64>,
    #[serde(default)]
    pub trades: Vec<JsonValue>,
    #[serde(default)]
    pub event_performance: JsonValue,
    /// Markdown report rendered by the engine, if any.
    #[serde(default)]
    pub report: Option<String>,
}

impl AnalysisOutput {
    pub fn new(summary: OutputSummary) -> Self {
        Self {
            summary,
            cumulative_return: None,
            trades: Vec::new(),
            event_performance: JsonValue::Null,
            report: None,
        }
    }

    pub fn with_report(mut self, report: impl Into<String>) -> Self {
        self.report = Some(report.into());
        self
    }
}

/// Narrative derived from a completed analysis.
///
/// This is *not* part of the primary result. It is persisted in the job's
/// secondary analysis block only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub markdown: String,

    /// Structured form of the narrative (sections, bullet lists, etc).
    #[serde(default)]
    pub structured: JsonValue,

    /// Model or generator that produced the text.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub prompt_version: Option<String>,
}

impl Narrative {
    pub fn new(markdown: impl Into<String>) -> Self {
        Self {
            markdown: markdown.into(),
            structured: JsonValue::Null,
            model: None,
            prompt_version: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_structured(mut self, structured: JsonValue) -> Self {
        self.structured = structured;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_output_decodes_flat_summary() {
        let output: AnalysisOutput = serde_json::from_value(serde_json::json!({
            "total_return": 12.5,
            "annualized_return": 12.1,
            "mdd": 8.0,
            "sharpe_ratio": 1.2,
            "win_rate": 55.0,
            "total_trades": 40,
            "total_profit": 20000000.0,
            "total_loss": 7500000.0,
            "cumulative_return": 12.5,
            "trades": [{ "symbol": "005930" }],
            "report": "# Report"
        }))
        .unwrap();

        assert_eq!(output.summary.total_trades, 40);
        assert_eq!(output.summary.net_profit(), 12_500_000.0);
        assert_eq!(output.trades.len(), 1);
        assert_eq!(output.report.as_deref(), Some("# Report"));
    }
}
