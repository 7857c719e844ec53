//! Drives one claimed job through preflight, execution, audit and retry until
//! it is finalized.
//!
//! The transition table lives in [`StateMachine`]; this module performs the
//! side effects of each phase and persists the result through the [`JobStore`].
//! Retry-eligible failures never leave [`Orchestrator::process`]: they end up
//! either in another attempt or in a `failed` row whose `error_message` leads
//! with the root finding's reason code. Persistence conflicts are the only
//! errors surfaced to the caller.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use backtestq_analysis::{EngineAdapter, NarrativeAdapter};
use backtestq_core::{
    AnalysisInput, AnalysisOutput, AttemptRecord, Finding, Job, JobId, Lease, ReasonCode,
    Severity, Stage,
};
use backtestq_pipeline::{
    AdjustmentStrategy, AuditVerdict, Auditor, FinalStatus, Phase, PlanDecision, Preflight,
    RetryBudget, RuleTablePlanner, StageOutcome, StateMachine, check_narrowing,
};

use crate::artifacts::{ArtifactWriter, DiscardArtifacts};
use crate::notifications::{JobNotification, NotificationKind, NotificationSink, TracingNotificationSink};

use super::store::{JobStore, JobStoreError};
use super::types::{AnalysisUpdate, Completion, Failure, RetryUpdate};

/// Where a retry continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Keep the row `in_progress` and loop in this orchestrator.
    #[default]
    InProcess,
    /// Write the revised input back as `pending`; any worker may resume it.
    Requeue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Handed back to the queue with a revised input.
    Requeued,
}

/// What processing one claimed job produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    pub outcome: JobOutcome,
    /// Advisory findings seen across every attempt, for quality tracking.
    pub advisory_findings: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Two orchestrators touched the same job.
    #[error("persistence conflict on job {job_id}: {source}")]
    PersistenceConflict {
        job_id: JobId,
        #[source]
        source: JobStoreError,
    },
    #[error("job store error on job {job_id}: {source}")]
    Store {
        job_id: JobId,
        #[source]
        source: JobStoreError,
    },
    #[error("job {0} was handed over without a lease")]
    MissingLease(JobId),
}

impl OrchestratorError {
    fn from_store(job_id: JobId, source: JobStoreError) -> Self {
        if source.is_conflict() {
            error!(job_id = %job_id, error = %source, "persistence conflict: job touched by two orchestrators");
            OrchestratorError::PersistenceConflict { job_id, source }
        } else {
            OrchestratorError::Store { job_id, source }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::PersistenceConflict { .. })
    }
}

/// Per-job orchestrator. Cheap to clone; every worker holds its own copy.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    preflight: Preflight,
    engine: EngineAdapter,
    auditor: Auditor,
    planner: Arc<dyn AdjustmentStrategy>,
    narrator: Option<NarrativeAdapter>,
    artifacts: Arc<dyn ArtifactWriter>,
    notifications: Arc<dyn NotificationSink>,
    retry_mode: RetryMode,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, preflight: Preflight, engine: EngineAdapter) -> Self {
        Self {
            store,
            preflight,
            engine,
            auditor: Auditor::default(),
            planner: Arc::new(RuleTablePlanner::default()),
            narrator: None,
            artifacts: Arc::new(DiscardArtifacts),
            notifications: Arc::new(TracingNotificationSink),
            retry_mode: RetryMode::default(),
        }
    }

    pub fn with_auditor(mut self, auditor: Auditor) -> Self {
        self.auditor = auditor;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn AdjustmentStrategy>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_narrator(mut self, narrator: NarrativeAdapter) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactWriter>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_retry_mode(mut self, retry_mode: RetryMode) -> Self {
        self.retry_mode = retry_mode;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Process a job returned by `claim_next_pending`.
    #[instrument(skip(self, job), fields(job_id = %job.id, retry_count = job.retry_count))]
    pub async fn process(&self, job: Job) -> Result<ProcessReport, OrchestratorError> {
        let lease = job.lease().ok_or(OrchestratorError::MissingLease(job.id))?;
        let mut run = Run {
            lease,
            budget: RetryBudget::new(job.retry_count, job.max_retries),
            history: job.history.clone(),
            findings: Vec::new(),
            stage: Stage::Preflight,
            root: None,
            advisory_findings: 0,
        };

        let mut input = match job.decode_input() {
            Ok(input) => input.normalized(),
            Err(e) => {
                run.findings = vec![Finding::blocking(ReasonCode::InvalidInput, e.to_string())];
                self.finalize_failed(&mut run).await?;
                return Ok(run.report(JobOutcome::Failed));
            }
        };

        let mut output: Option<AnalysisOutput> = None;
        let mut phase = Phase::Claimed;

        loop {
            let outcome = match phase {
                Phase::Claimed => StageOutcome::Ok,
                Phase::Preflighting => {
                    self.touch(&run.lease).await?;
                    self.preflight_stage(&input, &mut run).await
                }
                Phase::Executing => {
                    self.touch(&run.lease).await?;
                    match self.engine.run(&input).await {
                        Ok(out) => {
                            output = Some(out);
                            StageOutcome::Ok
                        }
                        Err(e) => {
                            warn!(job_id = %run.lease.job_id, error = %e, "execution failed");
                            run.stage = Stage::Execute;
                            run.findings = vec![e.to_finding()];
                            StageOutcome::RetryEligible
                        }
                    }
                }
                Phase::Auditing => {
                    self.touch(&run.lease).await?;
                    match &output {
                        Some(out) => self.audit_stage(&input, out, &mut run),
                        None => {
                            run.findings = vec![Finding::blocking(
                                ReasonCode::ExecutionFailed,
                                "no output reached the audit",
                            )];
                            StageOutcome::Terminal
                        }
                    }
                }
                Phase::Retrying => match self.retry_stage(&input, &mut run).await? {
                    Some(next) => {
                        input = next;
                        output = None;
                        if self.retry_mode == RetryMode::Requeue {
                            info!(job_id = %run.lease.job_id, retry_count = run.budget.used(), "job requeued with adjusted input");
                            return Ok(run.report(JobOutcome::Requeued));
                        }
                        StageOutcome::Ok
                    }
                    None => StageOutcome::Terminal,
                },
                Phase::Finalizing(FinalStatus::Completed) => {
                    let out = output.take();
                    return match out {
                        Some(out) => self.finalize_completed(&input, out, &mut run).await,
                        None => {
                            self.finalize_failed(&mut run).await?;
                            Ok(run.report(JobOutcome::Failed))
                        }
                    };
                }
                Phase::Finalizing(FinalStatus::Failed) => {
                    self.finalize_failed(&mut run).await?;
                    return Ok(run.report(JobOutcome::Failed));
                }
                Phase::Done => return Ok(run.report(JobOutcome::Failed)),
            };

            // Entering Retrying spends one unit of the shared budget.
            let next = StateMachine::next(phase, outcome, &run.budget);
            phase = match next {
                Phase::Retrying if run.budget.consume().is_none() => Phase::Finalizing(FinalStatus::Failed),
                next => next,
            };
        }
    }

    async fn touch(&self, lease: &Lease) -> Result<(), OrchestratorError> {
        self.store
            .touch(lease)
            .await
            .map_err(|e| OrchestratorError::from_store(lease.job_id, e))
    }

    async fn preflight_stage(&self, input: &AnalysisInput, run: &mut Run) -> StageOutcome {
        let report = self.preflight.check(input).await;
        run.stage = Stage::Preflight;
        run.note_advisories(&report.findings, Stage::Preflight);
        let ok = report.is_ok();
        run.findings = report.findings;
        if ok {
            StageOutcome::Ok
        } else {
            warn!(
                job_id = %run.lease.job_id,
                reason = %run.findings[0].code,
                findings = run.findings.len(),
                "preflight found blocking deficiencies"
            );
            StageOutcome::RetryEligible
        }
    }

    fn audit_stage(&self, input: &AnalysisInput, output: &AnalysisOutput, run: &mut Run) -> StageOutcome {
        let verdict = self.auditor.audit(input, output, &run.history);
        run.stage = Stage::Audit;
        run.note_advisories(verdict.findings(), Stage::Audit);
        match verdict {
            AuditVerdict::Pass => {
                run.findings.clear();
                StageOutcome::Ok
            }
            AuditVerdict::Retry { severity, findings } => {
                warn!(
                    job_id = %run.lease.job_id,
                    reason = %findings[0].code,
                    severity = ?severity,
                    "audit rejected output"
                );
                run.findings = findings;
                StageOutcome::RetryEligible
            }
            AuditVerdict::Fail { root, findings } => {
                warn!(job_id = %run.lease.job_id, reason = %root.code, "audit finding recurred after adjustment");
                run.root = Some(root);
                run.findings = findings;
                StageOutcome::Terminal
            }
        }
    }

    /// Ask the planner for the next input and persist it. `None` means no safe
    /// adjustment exists and the job must fail.
    async fn retry_stage(&self, input: &AnalysisInput, run: &mut Run) -> Result<Option<AnalysisInput>, OrchestratorError> {
        let retry_count = run.budget.used();
        let plan = match self.planner.plan(&run.findings, input, &run.history).await {
            PlanDecision::Adjust(plan) => plan,
            PlanDecision::Exhausted { root } => {
                warn!(job_id = %run.lease.job_id, reason = %root.code, "no further adjustment possible");
                run.root = Some(root);
                return Ok(None);
            }
        };

        let next = plan.apply(input);
        if let Err(rejection) = check_narrowing(input, &next, &run.history) {
            warn!(job_id = %run.lease.job_id, detail = %rejection.detail, "planner proposed a non-narrowing adjustment");
            // The job fails on the finding that triggered the retry; the
            // rejection is kept in the closing history record.
            run.root = run.findings.first().cloned();
            run.findings.push(rejection);
            return Ok(None);
        }

        let encoded = serde_json::to_value(&next).map_err(|e| {
            OrchestratorError::from_store(
                run.lease.job_id,
                JobStoreError::Invariant {
                    job_id: run.lease.job_id,
                    reason: format!("adjusted input does not encode: {e}"),
                },
            )
        })?;
        let record = AttemptRecord::new(retry_count, run.stage, run.findings.clone()).with_plan(plan);

        warn!(
            job_id = %run.lease.job_id,
            retry_count,
            max_retries = run.budget.max(),
            stage = %run.stage,
            reason = %run.findings.first().map(|f| f.code).unwrap_or(ReasonCode::ExecutionFailed),
            "retrying with adjusted input"
        );

        self.store
            .persist_retry(
                &run.lease,
                RetryUpdate {
                    input: encoded,
                    retry_count,
                    record: record.clone(),
                    requeue: self.retry_mode == RetryMode::Requeue,
                },
            )
            .await
            .map_err(|e| OrchestratorError::from_store(run.lease.job_id, e))?;

        run.history.push(record);
        Ok(Some(next))
    }

    async fn finalize_completed(
        &self,
        input: &AnalysisInput,
        output: AnalysisOutput,
        run: &mut Run,
    ) -> Result<ProcessReport, OrchestratorError> {
        let job_id = run.lease.job_id;

        let artifacts = match self.artifacts.write(job_id, &output).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "artifact write failed");
                run.stage = Stage::Finalize;
                run.findings = vec![Finding::blocking(ReasonCode::ArtifactWriteFailed, e.to_string())];
                run.root = None;
                self.finalize_failed(run).await?;
                return Ok(run.report(JobOutcome::Failed));
            }
        };

        self.store
            .persist_completed(
                &run.lease,
                Completion {
                    output: output.clone(),
                    artifacts,
                },
            )
            .await
            .map_err(|e| OrchestratorError::from_store(job_id, e))?;

        info!(job_id = %job_id, retry_count = run.budget.used(), "job completed");
        self.notifications
            .notify(JobNotification {
                job_id,
                kind: NotificationKind::Completed,
                message: format!(
                    "total_return={:.2}% trades={}",
                    output.summary.total_return, output.summary.total_trades
                ),
            })
            .await;

        self.narrate(job_id, input, &output).await;
        Ok(run.report(JobOutcome::Completed))
    }

    async fn finalize_failed(&self, run: &mut Run) -> Result<(), OrchestratorError> {
        let job_id = run.lease.job_id;
        let root = run
            .root
            .clone()
            .or_else(|| run.findings.first().cloned())
            .unwrap_or_else(|| Finding::blocking(ReasonCode::ExecutionFailed, "job failed without findings"));
        let error_message = root.summary();
        let retry_count = run.budget.used();

        self.store
            .persist_failed(
                &run.lease,
                Failure {
                    error_message: error_message.clone(),
                    retry_count,
                    record: AttemptRecord::new(retry_count, run.stage, run.findings.clone()),
                },
            )
            .await
            .map_err(|e| OrchestratorError::from_store(job_id, e))?;

        info!(job_id = %job_id, retry_count, reason = %root.code, "job failed");
        self.notifications
            .notify(JobNotification {
                job_id,
                kind: NotificationKind::Failed,
                message: error_message,
            })
            .await;
        Ok(())
    }

    /// Secondary path. Failures are recorded in the analysis block only.
    async fn narrate(&self, job_id: JobId, input: &AnalysisInput, output: &AnalysisOutput) {
        let Some(narrator) = &self.narrator else {
            if let Err(e) = self.store.persist_analysis(job_id, AnalysisUpdate::Skipped).await {
                warn!(job_id = %job_id, error = %e, "failed to record skipped analysis");
            }
            return;
        };

        if let Err(e) = self.store.persist_analysis(job_id, AnalysisUpdate::Running).await {
            warn!(job_id = %job_id, error = %e, "failed to mark analysis running");
            return;
        }

        let started = Instant::now();
        let result = narrator.summarize(input, output).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let update = match result {
            Ok(narrative) => AnalysisUpdate::Completed { narrative, elapsed_ms },
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "narrative failed");
                AnalysisUpdate::Failed {
                    error: e.to_string(),
                    elapsed_ms,
                }
            }
        };
        if let Err(e) = self.store.persist_analysis(job_id, update).await {
            warn!(job_id = %job_id, error = %e, "failed to record analysis result");
        }
    }
}

/// Mutable state of one `process` call.
struct Run {
    lease: Lease,
    budget: RetryBudget,
    history: Vec<AttemptRecord>,
    /// Findings of the most recent unsuccessful stage, blocking first.
    findings: Vec<Finding>,
    stage: Stage,
    /// Root cause of a terminal outcome, when it is not `findings[0]`.
    root: Option<Finding>,
    advisory_findings: usize,
}

impl Run {
    fn note_advisories(&mut self, findings: &[Finding], stage: Stage) {
        for finding in findings.iter().filter(|f| f.severity == Severity::Advisory) {
            self.advisory_findings += 1;
            info!(
                job_id = %self.lease.job_id,
                quality = "advisory",
                stage = %stage,
                reason = %finding.code,
                subject = finding.subject.as_deref().unwrap_or(""),
                detail = %finding.detail,
                "advisory finding"
            );
        }
    }

    fn report(&self, outcome: JobOutcome) -> ProcessReport {
        ProcessReport {
            outcome,
            advisory_findings: self.advisory_findings,
        }
    }
}
