//! Structured deficiencies and consistency violations.
//!
//! Preflight and the result auditor both speak in [`Finding`]s. A finding carries
//! a machine-readable [`ReasonCode`], a [`Severity`], an optional subject (usually
//! a symbol) and, when the producer knows one, the [`Adjustment`] that would
//! remove it.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::plan::Adjustment;

/// How strongly a finding argues against the current attempt.
///
/// Ordering is meaningful: `Blocking > Advisory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Suspicious but not certainly wrong; retried and tracked for quality.
    Advisory,
    /// Impossible or known-empty; the attempt must not be accepted.
    Blocking,
}

/// Machine-readable reason code.
///
/// The snake_case form is what lands in `error_message` and in the attempt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Stored input does not decode into an analysis input.
    InvalidInput,
    /// No symbols requested and the full universe is not allowed.
    NoSubjects,
    /// A requested symbol has no price rows inside the window.
    MissingPriceData,
    /// Per-symbol covered ranges do not overlap.
    NoCommonWindow,
    /// The common covered range is narrower than requested.
    PartialCoverage,
    /// Disclosures requested but none exist for a symbol.
    MissingDisclosureData,
    /// The coverage source could not be queried.
    CoverageUnavailable,
    /// The computation collaborator failed.
    ExecutionFailed,
    /// The computation collaborator exceeded its time budget.
    ExecutionTimeout,
    /// No trades but a non-negligible aggregate return.
    ZeroActivityWithReturn,
    /// A bounded output field lies outside its domain.
    OutOfDomain,
    /// Aggregate return and realised profit point in opposite directions.
    DirectionMismatch,
    /// A proposed plan would not narrow the next attempt.
    NonNarrowingAdjustment,
    /// Result artifacts could not be written.
    ArtifactWriteFailed,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::InvalidInput => "invalid_input",
            ReasonCode::NoSubjects => "no_subjects",
            ReasonCode::MissingPriceData => "missing_price_data",
            ReasonCode::NoCommonWindow => "no_common_window",
            ReasonCode::PartialCoverage => "partial_coverage",
            ReasonCode::MissingDisclosureData => "missing_disclosure_data",
            ReasonCode::CoverageUnavailable => "coverage_unavailable",
            ReasonCode::ExecutionFailed => "execution_failed",
            ReasonCode::ExecutionTimeout => "execution_timeout",
            ReasonCode::ZeroActivityWithReturn => "zero_activity_with_return",
            ReasonCode::OutOfDomain => "out_of_domain",
            ReasonCode::DirectionMismatch => "direction_mismatch",
            ReasonCode::NonNarrowingAdjustment => "non_narrowing_adjustment",
            ReasonCode::ArtifactWriteFailed => "artifact_write_failed",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured deficiency (preflight) or consistency violation (audit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub code: ReasonCode,
    pub severity: Severity,
    /// What the finding is about, e.g. a symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub detail: String,
    /// Adjustment that would remove this finding, if one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remedy: Option<Adjustment>,
}

impl Finding {
    pub fn blocking(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self::new(code, Severity::Blocking, detail)
    }

    pub fn advisory(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self::new(code, Severity::Advisory, detail)
    }

    fn new(code: ReasonCode, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            subject: None,
            detail: detail.into(),
            remedy: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_remedy(mut self, remedy: Adjustment) -> Self {
        self.remedy = Some(remedy);
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }

    /// `"<code>: <detail>"`, the form surfaced to submitters.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.code, self.detail)
    }
}

/// Order findings blocking first, then by reason code and subject.
///
/// Producers call this before returning so that equal inputs give equal lists.
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.subject.cmp(&b.subject))
    });
}
