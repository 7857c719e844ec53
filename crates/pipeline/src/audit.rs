//! Result auditor: ordered consistency rules over `(input, output)`.
//!
//! Each rule cross-checks fields that are derived independently by the engine
//! and yields at most one finding:
//!
//! 1. zero trades next to a non-negligible total return (blocking)
//! 2. a bounded field outside its domain, or a non-finite metric (blocking)
//! 3. total return and realised net profit pointing in opposite directions (advisory)

use serde::Deserialize;

use backtestq_core::{AnalysisInput, AnalysisOutput, AttemptRecord, Finding, ReasonCode, Severity};

/// What to do when an advisory finding recurs after an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryRecurrence {
    /// Keep retrying under the shared budget.
    #[default]
    SharedBudget,
    /// Treat the recurrence as terminal.
    Escalate,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// `|total_return|` at or below this many percent counts as no outcome.
    pub negligible_return_pct: f64,
    pub advisory_recurrence: AdvisoryRecurrence,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            negligible_return_pct: 0.01,
            advisory_recurrence: AdvisoryRecurrence::SharedBudget,
        }
    }
}

/// Classification of one execution's output.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditVerdict {
    Pass,
    /// Retry-eligible; `severity` is the most severe finding.
    Retry { severity: Severity, findings: Vec<Finding> },
    /// A recurring advisory finding under [`AdvisoryRecurrence::Escalate`].
    Fail { root: Finding, findings: Vec<Finding> },
}

impl AuditVerdict {
    pub fn findings(&self) -> &[Finding] {
        match self {
            AuditVerdict::Pass => &[],
            AuditVerdict::Retry { findings, .. } | AuditVerdict::Fail { findings, .. } => findings,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Auditor {
    config: AuditConfig,
}

impl Auditor {
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Run every rule in order. Blocking findings come first.
    pub fn findings(&self, _input: &AnalysisInput, output: &AnalysisOutput) -> Vec<Finding> {
        let s = &output.summary;
        let negligible = self.config.negligible_return_pct;
        let mut findings = Vec::new();

        if s.total_trades == 0 && s.total_return.abs() > negligible {
            findings.push(Finding::blocking(
                ReasonCode::ZeroActivityWithReturn,
                format!("total_return = {} with zero trades", s.total_return),
            ));
        }

        let mut violations = Vec::new();
        for (name, value) in [("mdd", s.mdd), ("win_rate", s.win_rate)] {
            if !(0.0..=100.0).contains(&value) {
                violations.push(format!("{name} = {value} outside 0..=100"));
            }
        }
        for (name, value) in [
            ("total_return", s.total_return),
            ("annualized_return", s.annualized_return),
            ("sharpe_ratio", s.sharpe_ratio),
            ("total_profit", s.total_profit),
            ("total_loss", s.total_loss),
        ] {
            if !value.is_finite() {
                violations.push(format!("{name} is not finite"));
            }
        }
        if !violations.is_empty() {
            findings.push(Finding::blocking(ReasonCode::OutOfDomain, violations.join("; ")));
        }

        let net = s.net_profit();
        if s.total_return.abs() > negligible && net != 0.0 && s.total_return.signum() != net.signum() {
            findings.push(Finding::advisory(
                ReasonCode::DirectionMismatch,
                format!("total_return = {} but net profit = {}", s.total_return, net),
            ));
        }

        findings
    }

    /// Classify an output, taking earlier attempts into account.
    ///
    /// A recurring blocking finding stays retry-eligible: the job fails once the
    /// planner has no untried adjustment left for it or the budget runs out. A
    /// recurring advisory finding fails the job under
    /// [`AdvisoryRecurrence::Escalate`].
    pub fn audit(
        &self,
        input: &AnalysisInput,
        output: &AnalysisOutput,
        history: &[AttemptRecord],
    ) -> AuditVerdict {
        let findings = self.findings(input, output);
        if findings.is_empty() {
            return AuditVerdict::Pass;
        }

        let escalate = self.config.advisory_recurrence == AdvisoryRecurrence::Escalate;
        let recurring = findings
            .iter()
            .filter(|f| escalate && !f.is_blocking())
            .find(|f| history.iter().any(|r| r.has_code(f.code)));

        match recurring {
            Some(root) => AuditVerdict::Fail {
                root: root.clone(),
                findings,
            },
            None => {
                let severity = findings
                    .iter()
                    .map(|f| f.severity)
                    .max()
                    .unwrap_or(Severity::Advisory);
                AuditVerdict::Retry { severity, findings }
            }
        }
    }
}
