//! Scenario tests for the job queue against the in-memory store.
//!
//! Verifies:
//! - happy path and bounded retry exhaustion under the shared budget
//! - stranded-job recovery and lease loss
//! - exclusive claim under concurrency
//! - double finalization is a loud conflict
//! - narrative failures never touch the primary status

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};

    use backtestq_analysis::{
        AnalysisEngine, EngineAdapter, ExecutionError, NarrativeAdapter, NarrativeError, Narrator,
        SecretGuard, StaticCoverageSource,
    };
    use backtestq_core::{
        Adjustment, AdjustmentPlan, AnalysisInput, AnalysisOutput, AnalysisStatus, AttemptRecord,
        Finding, JobStatus, Narrative, NewJob, OutputSummary,
    };
    use backtestq_pipeline::{AdjustmentStrategy, PlanDecision, Preflight, PreflightConfig};

    use crate::artifacts::FsArtifactWriter;
    use crate::jobs::{
        InMemoryJobStore, JobOutcome, JobStore, Orchestrator, RetryMode, StaleJobSweeper,
        WorkerPool, WorkerPoolConfig, poll_once,
    };
    use crate::notifications::{InMemoryNotificationSink, NotificationKind};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn input() -> AnalysisInput {
        AnalysisInput::for_symbols(["005930", "000660"]).with_window(date(2024, 1, 1), date(2024, 12, 31))
    }

    fn full_coverage() -> StaticCoverageSource {
        let (first, last) = (date(2020, 1, 1), date(2025, 12, 31));
        StaticCoverageSource::new()
            .with_prices("005930", first, last)
            .with_prices("000660", first, last)
            .with_disclosures("005930", first, last)
            .with_disclosures("000660", first, last)
    }

    fn good_output() -> AnalysisOutput {
        AnalysisOutput::new(OutputSummary {
            total_return: 12.0,
            annualized_return: 11.8,
            mdd: 7.5,
            sharpe_ratio: 1.3,
            win_rate: 58.0,
            total_trades: 42,
            total_profit: 20_000_000.0,
            total_loss: 8_000_000.0,
        })
        .with_report("# Backtest report\n")
    }

    fn zero_trade_output() -> AnalysisOutput {
        let mut output = good_output();
        output.summary.total_trades = 0;
        output.summary.total_return = 50.0;
        output
    }

    /// Replays scripted results, then repeats the last one.
    struct ScriptedEngine {
        script: Mutex<VecDeque<Result<AnalysisOutput, ExecutionError>>>,
        last: Result<AnalysisOutput, ExecutionError>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<AnalysisOutput, ExecutionError>>) -> Arc<Self> {
            let last = script
                .last()
                .cloned()
                .unwrap_or_else(|| Ok(good_output()));
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last,
                calls: AtomicUsize::new(0),
            })
        }

        fn always(result: Result<AnalysisOutput, ExecutionError>) -> Arc<Self> {
            Self::new(vec![result])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn execute(&self, _input: &AnalysisInput) -> Result<AnalysisOutput, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.last.clone())
        }
    }

    struct FixedNarrator(Result<Narrative, NarrativeError>);

    #[async_trait]
    impl Narrator for FixedNarrator {
        async fn summarize(&self, _input: &AnalysisInput, _output: &AnalysisOutput) -> Result<Narrative, NarrativeError> {
            self.0.clone()
        }
    }

    /// Moves the window start forward by one day on every retry.
    struct ShrinkByOneDay;

    #[async_trait]
    impl AdjustmentStrategy for ShrinkByOneDay {
        async fn plan(&self, findings: &[Finding], input: &AnalysisInput, _history: &[AttemptRecord]) -> PlanDecision {
            PlanDecision::Adjust(AdjustmentPlan::new(
                findings[0].code,
                vec![Adjustment::NarrowWindow {
                    start: input.start_date + chrono::Duration::days(1),
                    end: input.end_date,
                }],
            ))
        }
    }

    /// Proposes a plan that changes nothing.
    struct NoOpStrategy;

    #[async_trait]
    impl AdjustmentStrategy for NoOpStrategy {
        async fn plan(&self, findings: &[Finding], _input: &AnalysisInput, _history: &[AttemptRecord]) -> PlanDecision {
            PlanDecision::Adjust(AdjustmentPlan::new(findings[0].code, vec![]))
        }
    }

    fn orchestrator(
        store: Arc<InMemoryJobStore>,
        coverage: StaticCoverageSource,
        engine: Arc<ScriptedEngine>,
    ) -> Orchestrator {
        Orchestrator::new(
            store,
            Preflight::new(Arc::new(coverage), PreflightConfig::default()),
            EngineAdapter::new(engine, Duration::from_secs(5)),
        )
    }

    async fn enqueue(store: &InMemoryJobStore, input: &AnalysisInput, max_retries: u32) -> backtestq_core::JobId {
        store
            .enqueue(NewJob::from_input(input).unwrap().with_max_retries(max_retries))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_completes_without_retries() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::always(Ok(good_output()));
        let sink = Arc::new(InMemoryNotificationSink::new());
        let orch = orchestrator(store.clone(), full_coverage(), engine.clone()).with_notifications(sink.clone());
        let job_id = enqueue(&store, &input(), 2).await;

        let report = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.advisory_findings, 0);

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.output, Some(good_output()));
        assert!(job.error_message.is_none());
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.lease.is_none());
        assert!(job.history.is_empty());
        assert_eq!(job.analysis.status, AnalysisStatus::Skipped);
        assert_eq!(engine.calls(), 1);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Completed);

        // Queue drained
        assert!(poll_once(&orch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preflight_deficiency_on_every_attempt_exhausts_budget() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::always(Ok(good_output()));
        let orch = orchestrator(store.clone(), StaticCoverageSource::new(), engine.clone())
            .with_planner(Arc::new(ShrinkByOneDay));
        let job_id = enqueue(&store, &input(), 2).await;

        let report = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Failed);

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert!(job.error_message.as_deref().unwrap().starts_with("missing_price_data"));
        assert!(job.output.is_none());
        assert_eq!(engine.calls(), 0);

        // Two retries plus the closing record, attempts strictly increasing.
        let attempts: Vec<u32> = job.history.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 2]);
        assert!(job.history[0].plan.is_some());
        assert!(job.history[2].plan.is_none());

        let stored_input = job.decode_input().unwrap();
        assert_eq!(stored_input.start_date, date(2024, 1, 3));
    }

    #[tokio::test]
    async fn execution_failures_share_one_budget_with_default_planner() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::always(Err(ExecutionError::Engine("boom".into())));
        let orch = orchestrator(store.clone(), full_coverage(), engine.clone());
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error_message.as_deref(), Some("execution_failed: engine failed: boom"));
        assert_eq!(engine.calls(), 3);

        // Each retry halved the window.
        let stored_input = job.decode_input().unwrap();
        assert!(stored_input.window_days() < input().window_days() / 3);
    }

    #[tokio::test]
    async fn recovery_after_one_execution_failure() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::new(vec![
            Err(ExecutionError::Timeout(Duration::from_secs(600))),
            Ok(good_output()),
        ]);
        let orch = orchestrator(store.clone(), full_coverage(), engine.clone());
        let job_id = enqueue(&store, &input(), 2).await;

        let report = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.is_none());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].has_code(backtestq_core::ReasonCode::ExecutionTimeout));
    }

    #[tokio::test]
    async fn recurring_audit_finding_fails_once_planner_avenues_are_spent() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::always(Ok(zero_trade_output()));
        let orch = orchestrator(store.clone(), full_coverage(), engine.clone());
        let job_id = enqueue(&store, &input(), 3).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.as_deref().unwrap().starts_with("zero_activity_with_return"));
        assert_eq!(engine.calls(), 2);

        // The only avenue left for the default input was disabling disclosures.
        assert!(!job.decode_input().unwrap().use_dart_disclosure);
    }

    #[tokio::test]
    async fn recurring_zero_activity_walks_every_planner_avenue() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::new(vec![
            Ok(zero_trade_output()),
            Ok(zero_trade_output()),
            Ok(good_output()),
        ]);
        let orch = orchestrator(store.clone(), full_coverage(), engine.clone());
        let mut with_conditions = input();
        with_conditions.event_indicator_conditions = vec![serde_json::json!({"indicator": "rsi", "op": "<", "value": 30})];
        let job_id = enqueue(&store, &with_conditions, 3).await;

        let report = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
        assert!(job.error_message.is_none());
        assert_eq!(engine.calls(), 3);

        let plans: Vec<Vec<Adjustment>> = job
            .history
            .iter()
            .map(|r| r.plan.as_ref().unwrap().changes.clone())
            .collect();
        assert_eq!(
            plans,
            vec![vec![Adjustment::ClearIndicatorConditions], vec![Adjustment::DisableDisclosures]]
        );

        let stored_input = job.decode_input().unwrap();
        assert!(stored_input.event_indicator_conditions.is_empty());
        assert!(!stored_input.use_dart_disclosure);
    }

    #[tokio::test]
    async fn non_narrowing_plan_is_rejected() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::always(Err(ExecutionError::Engine("boom".into())));
        let orch = orchestrator(store.clone(), full_coverage(), engine).with_planner(Arc::new(NoOpStrategy));
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("execution_failed: engine failed: boom"));
        assert_eq!(job.retry_count, 1);

        let closing = job.history.last().unwrap();
        assert!(closing.has_code(backtestq_core::ReasonCode::NonNarrowingAdjustment));
        assert!(closing.plan.is_none());
    }

    #[tokio::test]
    async fn undecodable_input_fails_without_spending_retries() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::always(Ok(good_output()));
        let orch = orchestrator(store.clone(), full_coverage(), engine.clone());
        let job_id = store
            .enqueue(NewJob::new(serde_json::json!({"target_symbols": 5})))
            .await
            .unwrap();

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert!(job.error_message.as_deref().unwrap().starts_with("invalid_input"));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn partial_coverage_is_advisory_and_still_executes() {
        let store = InMemoryJobStore::arc();
        let coverage = StaticCoverageSource::new()
            .with_prices("005930", date(2024, 3, 1), date(2024, 12, 31))
            .with_prices("000660", date(2020, 1, 1), date(2025, 12, 31))
            .with_disclosures("005930", date(2020, 1, 1), date(2025, 12, 31))
            .with_disclosures("000660", date(2020, 1, 1), date(2025, 12, 31));
        let engine = ScriptedEngine::always(Ok(good_output()));
        let orch = orchestrator(store.clone(), coverage, engine.clone());
        enqueue(&store, &input(), 2).await;

        let report = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.advisory_findings, 1);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn requeue_mode_hands_the_revised_input_back_to_the_queue() {
        let store = InMemoryJobStore::arc();
        let engine = ScriptedEngine::new(vec![Err(ExecutionError::Engine("boom".into())), Ok(good_output())]);
        let orch = orchestrator(store.clone(), full_coverage(), engine).with_retry_mode(RetryMode::Requeue);
        let job_id = enqueue(&store, &input(), 2).await;

        let first = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(first.outcome, JobOutcome::Requeued);
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.lease.is_none());

        let second = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(second.outcome, JobOutcome::Completed);
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn stranded_job_is_recovered_by_another_worker() {
        let store = InMemoryJobStore::arc();
        let job_id = enqueue(&store, &input(), 2).await;

        // A worker claims the job and crashes without any further write.
        let crashed = store.claim_next_pending().await.unwrap().unwrap();
        let stale_lease = crashed.lease().unwrap();
        store.backdate(job_id, Utc::now() - chrono::Duration::hours(1)).unwrap();

        let sweeper = StaleJobSweeper::new(store.clone(), Duration::from_secs(1800), Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await.unwrap(), vec![job_id]);
        assert_eq!(store.get(job_id).await.unwrap().unwrap().status, JobStatus::Pending);

        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())));
        let report = poll_once(&orch).await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);

        // The crashed worker's late write is rejected.
        let err = store.touch(&stale_lease).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(job_id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_one_row_once() {
        let store = InMemoryJobStore::arc();
        let job_id = enqueue(&store, &input(), 2).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.claim_next_pending().await.unwrap() }));
        }

        let mut winners = Vec::new();
        for task in tasks {
            if let Some(job) = task.await.unwrap() {
                winners.push(job.id);
            }
        }
        assert_eq!(winners, vec![job_id]);
    }

    #[tokio::test]
    async fn processing_a_finalized_job_again_is_a_conflict() {
        let store = InMemoryJobStore::arc();
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())));
        enqueue(&store, &input(), 2).await;

        let job = store.claim_next_pending().await.unwrap().unwrap();
        let duplicate = job.clone();
        orch.process(job).await.unwrap();
        let before = store.get(duplicate.id).await.unwrap().unwrap();

        let err = orch.process(duplicate.clone()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(duplicate.id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn narrative_failure_leaves_job_completed() {
        let store = InMemoryJobStore::arc();
        let narrator = NarrativeAdapter::new(
            Arc::new(FixedNarrator(Err(NarrativeError::Service("502: bad gateway".into())))),
            Duration::from_secs(5),
            SecretGuard::new().unwrap(),
        );
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())))
            .with_narrator(narrator);
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error_message.is_none());
        assert_eq!(job.analysis.status, AnalysisStatus::Failed);
        assert!(job.analysis.error.as_deref().unwrap().contains("502"));
        assert!(job.analysis.started_at.is_some());
        assert!(job.analysis.completed_at.is_some());
    }

    #[tokio::test]
    async fn narrative_with_secret_is_rejected() {
        let store = InMemoryJobStore::arc();
        let leaked = Narrative::new("Connect with postgres://admin:hunter2@db:5432/quant for details.");
        let narrator = NarrativeAdapter::new(
            Arc::new(FixedNarrator(Ok(leaked))),
            Duration::from_secs(5),
            SecretGuard::new().unwrap(),
        );
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())))
            .with_narrator(narrator);
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.analysis.status, AnalysisStatus::Failed);
        assert!(job.analysis.output.is_none());
    }

    #[tokio::test]
    async fn narrative_success_fills_analysis_block() {
        let store = InMemoryJobStore::arc();
        let narrator = NarrativeAdapter::new(
            Arc::new(FixedNarrator(Ok(Narrative::new("Steady gains.").with_model("summary-v1")))),
            Duration::from_secs(5),
            SecretGuard::new().unwrap(),
        );
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())))
            .with_narrator(narrator);
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.analysis.status, AnalysisStatus::Completed);
        assert_eq!(job.analysis.output.unwrap().markdown, "Steady gains.");
        assert!(job.analysis.elapsed_ms.is_some());
    }

    #[tokio::test]
    async fn artifacts_are_written_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())))
            .with_artifacts(Arc::new(FsArtifactWriter::new(dir.path())));
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        let artifacts = job.artifacts.unwrap();
        assert!(std::path::Path::new(&artifacts.result_path).exists());
        assert!(std::path::Path::new(&artifacts.report_path.unwrap()).exists());
    }

    #[tokio::test]
    async fn artifact_write_failure_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("results");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = InMemoryJobStore::arc();
        let sink = Arc::new(InMemoryNotificationSink::new());
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())))
            .with_artifacts(Arc::new(FsArtifactWriter::new(&blocker)))
            .with_notifications(sink.clone());
        let job_id = enqueue(&store, &input(), 2).await;

        poll_once(&orch).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.output.is_none());
        assert!(job.error_message.as_deref().unwrap().starts_with("artifact_write_failed"));
        assert_eq!(sink.sent()[0].kind, NotificationKind::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_drains_the_queue() {
        let store = InMemoryJobStore::arc();
        for _ in 0..6 {
            enqueue(&store, &input(), 2).await;
        }
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())));
        let handle = WorkerPool::spawn(
            orch,
            WorkerPoolConfig::default()
                .with_workers(3)
                .with_poll_interval(Duration::from_millis(10)),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while handle.stats().jobs_completed < 6 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(store.stats().await.unwrap().completed, 6);
        assert_eq!(stats.jobs_completed, 6);
        assert_eq!(stats.conflicts, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_counts_failed_jobs_like_poll_once() {
        let store = InMemoryJobStore::arc();
        for _ in 0..3 {
            enqueue(&store, &input(), 2).await;
        }
        for _ in 0..2 {
            store
                .enqueue(NewJob::new(serde_json::json!({"target_symbols": "005930"})))
                .await
                .unwrap();
        }
        let orch = orchestrator(store.clone(), full_coverage(), ScriptedEngine::always(Ok(good_output())));
        let handle = WorkerPool::spawn(
            orch,
            WorkerPoolConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(10)),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while handle.stats().jobs_processed < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.jobs_processed, 5);
        assert_eq!(stats.jobs_completed, 3);
        assert_eq!(stats.jobs_failed, 2);
        assert_eq!(stats.store_errors, 0);
        assert_eq!(stats.conflicts, 0);

        let counts = store.stats().await.unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.pending, 0);
    }
}
