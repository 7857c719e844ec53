//! Postgres-backed job store.
//!
//! One row per job in `analysis_jobs`. Ownership is enforced in SQL: every
//! write against an `in_progress` row is guarded by
//! `status = 'in_progress' AND lease_token = $2`, so a write from an orchestrator
//! that lost its lease matches no row and nothing changes.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `JobStoreError` |
//! |------------|-----------------|-----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (checked in `enqueue` before mapping) |
//! | Database (serialization failure / lock not available) | `40001`, `55P03` | `ClaimConflict` |
//! | Database (check violation) | `23514` | `Storage` (message names the constraint) |
//! | anything else | any | `Storage` |
//!
//! A guarded update that matches no row is classified by re-reading the row:
//! absent rows are `NotFound`, absorbing rows `AlreadyFinalized`, rows held under
//! another (or no) lease `LeaseLost`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use backtestq_core::{
    AnalysisBlock, AnalysisOutput, AnalysisStatus, Artifacts, AttemptRecord, Job, JobId,
    JobStatus, Lease, LeaseToken, NewJob,
};

use super::store::{JobStore, JobStoreError, ownership_error};
use super::types::{AnalysisUpdate, Completion, Failure, JobStats, RetryUpdate};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_jobs (
        id                      UUID PRIMARY KEY,
        status                  TEXT NOT NULL DEFAULT 'pending'
                                CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
        input                   JSONB NOT NULL,
        output                  JSONB,
        result_path             TEXT,
        report_path             TEXT,
        retry_count             INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retries             INTEGER NOT NULL DEFAULT 2 CHECK (max_retries >= 0),
        error_message           TEXT,
        lease_token             UUID,
        history                 JSONB NOT NULL DEFAULT '[]'::jsonb,
        analysis_status         TEXT NOT NULL DEFAULT 'pending',
        analysis_output         JSONB,
        analysis_error          TEXT,
        analysis_model          TEXT,
        analysis_started_at     TIMESTAMPTZ,
        analysis_completed_at   TIMESTAMPTZ,
        analysis_elapsed_ms     BIGINT,
        created_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at              TIMESTAMPTZ,
        completed_at            TIMESTAMPTZ,
        updated_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK (retry_count <= max_retries)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS analysis_jobs_pending_idx ON analysis_jobs (created_at, id) WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS analysis_jobs_in_progress_idx ON analysis_jobs (updated_at) WHERE status = 'in_progress'",
];

/// Postgres-backed job store.
///
/// Claim uses `FOR UPDATE SKIP LOCKED`, so concurrent workers in any number of
/// processes never receive the same row and never block on each other.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the jobs table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Explain why a guarded write on `lease` matched no row.
    async fn rejection(&self, lease: &Lease, operation: &str) -> JobStoreError {
        let row = sqlx::query("SELECT status, lease_token FROM analysis_jobs WHERE id = $1")
            .bind(lease.job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return JobStoreError::NotFound(lease.job_id),
            Err(e) => return map_sqlx_error(operation, e),
        };

        let status = match read_status(&row) {
            Ok(status) => status,
            Err(e) => return e,
        };
        let token: Option<Uuid> = match row.try_get("lease_token") {
            Ok(token) => token,
            Err(e) => return map_sqlx_error(operation, e),
        };

        ownership_error(lease.job_id, status, token.map(LeaseToken::from_uuid), lease.token)
            .unwrap_or_else(|| JobStoreError::Invariant {
                job_id: lease.job_id,
                reason: format!("{operation} rejected by retry budget guard"),
            })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (id, status, input, max_retries)
            VALUES ($1, 'pending', $2, $3)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.input)
        .bind(job.max_retries as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM analysis_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM analysis_jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE analysis_jobs j
            SET status = 'in_progress',
                lease_token = $1,
                started_at = COALESCE(j.started_at, NOW()),
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING j.*
            "#,
        )
        .bind(LeaseToken::new().as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next_pending", e))?;

        match row {
            Some(row) => decode_job(&row).map(Some),
            None => {
                debug!("no pending jobs");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id), err)]
    async fn touch(&self, lease: &Lease) -> Result<(), JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress' AND lease_token = $2
            RETURNING id
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.rejection(lease, "touch").await),
        }
    }

    #[instrument(
        skip(self, lease, update),
        fields(job_id = %lease.job_id, retry_count = update.retry_count, requeue = update.requeue),
        err
    )]
    async fn persist_retry(&self, lease: &Lease, update: RetryUpdate) -> Result<(), JobStoreError> {
        let record = encode_history(&[update.record])?;

        let row = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET input = $3,
                retry_count = $4,
                error_message = NULL,
                history = history || $5::jsonb,
                status = CASE WHEN $6 THEN 'pending' ELSE status END,
                lease_token = CASE WHEN $6 THEN NULL ELSE lease_token END,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'in_progress'
              AND lease_token = $2
              AND retry_count + 1 = $4
              AND $4 <= max_retries
            RETURNING id
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .bind(&update.input)
        .bind(update.retry_count as i32)
        .bind(record)
        .bind(update.requeue)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("persist_retry", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.rejection(lease, "persist_retry").await),
        }
    }

    #[instrument(skip(self, lease, completion), fields(job_id = %lease.job_id), err)]
    async fn persist_completed(&self, lease: &Lease, completion: Completion) -> Result<(), JobStoreError> {
        let output = serde_json::to_value(&completion.output).map_err(|e| JobStoreError::Invariant {
            job_id: lease.job_id,
            reason: format!("output does not encode: {e}"),
        })?;
        let (result_path, report_path) = match completion.artifacts {
            Some(a) => (Some(a.result_path), a.report_path),
            None => (None, None),
        };

        let row = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed',
                output = $3,
                result_path = $4,
                report_path = $5,
                error_message = NULL,
                lease_token = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress' AND lease_token = $2
            RETURNING id
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .bind(output)
        .bind(result_path)
        .bind(report_path)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("persist_completed", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.rejection(lease, "persist_completed").await),
        }
    }

    #[instrument(
        skip(self, lease, failure),
        fields(job_id = %lease.job_id, retry_count = failure.retry_count),
        err
    )]
    async fn persist_failed(&self, lease: &Lease, failure: Failure) -> Result<(), JobStoreError> {
        let record = encode_history(&[failure.record])?;

        let row = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed',
                error_message = $3,
                retry_count = $4,
                history = history || $5::jsonb,
                lease_token = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'in_progress'
              AND lease_token = $2
              AND $4 >= retry_count
              AND $4 <= max_retries
            RETURNING id
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.token.as_uuid())
        .bind(&failure.error_message)
        .bind(failure.retry_count as i32)
        .bind(record)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("persist_failed", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.rejection(lease, "persist_failed").await),
        }
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'pending',
                lease_token = NULL,
                updated_at = NOW()
            WHERE status = 'in_progress' AND updated_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("requeue_stale", e))?;
            ids.push(JobId::from_uuid(id));
        }
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, analysis_status = %update.status()), err)]
    async fn persist_analysis(&self, job_id: JobId, update: AnalysisUpdate) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT * FROM analysis_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("persist_analysis", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let status = read_status(&row)?;
        if status != JobStatus::Completed {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::Invariant {
                job_id,
                reason: format!("analysis written while job is {status}"),
            });
        }

        let mut block = JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("persist_analysis", e))?
            .analysis_block(job_id)?;
        update.apply_to(&mut block, Utc::now());

        let narrative = block
            .output
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| JobStoreError::Invariant {
                job_id,
                reason: format!("narrative does not encode: {e}"),
            })?;
        let model = block.output.as_ref().and_then(|n| n.model.clone());

        sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET analysis_status = $2,
                analysis_output = $3,
                analysis_error = $4,
                analysis_model = $5,
                analysis_started_at = $6,
                analysis_completed_at = $7,
                analysis_elapsed_ms = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(block.status.as_str())
        .bind(narrative)
        .bind(&block.error)
        .bind(model)
        .bind(block.started_at)
        .bind(block.completed_at)
        .bind(block.elapsed_ms.map(|ms| ms as i64))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("persist_analysis", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM analysis_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let total = total as usize;
            match read_status(&row)? {
                JobStatus::Pending => stats.pending = total,
                JobStatus::InProgress => stats.in_progress = total,
                JobStatus::Completed => stats.completed = total,
                JobStatus::Failed => stats.failed = total,
            }
        }
        Ok(stats)
    }
}

fn read_status(row: &PgRow) -> Result<JobStatus, JobStoreError> {
    let status: String = row.try_get("status").map_err(|e| map_sqlx_error("read_status", e))?;
    status
        .parse()
        .map_err(|e| JobStoreError::Storage(format!("unreadable status column: {e}")))
}

fn encode_history(records: &[AttemptRecord]) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(records)
        .map_err(|e| JobStoreError::Storage(format!("attempt record does not encode: {e}")))
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .into_job()
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            classify_db_error(db_err.code().as_deref(), msg)
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn classify_db_error(code: Option<&str>, msg: String) -> JobStoreError {
    match code {
        // Serialization failure / lock not available
        Some("40001") | Some("55P03") => JobStoreError::ClaimConflict(msg),
        Some("23514") => JobStoreError::Storage(format!("check constraint violated: {msg}")),
        _ => JobStoreError::Storage(msg),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    status: String,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    result_path: Option<String>,
    report_path: Option<String>,
    retry_count: i32,
    max_retries: i32,
    error_message: Option<String>,
    lease_token: Option<Uuid>,
    history: serde_json::Value,
    analysis_status: String,
    analysis_output: Option<serde_json::Value>,
    analysis_error: Option<String>,
    analysis_started_at: Option<DateTime<Utc>>,
    analysis_completed_at: Option<DateTime<Utc>>,
    analysis_elapsed_ms: Option<i64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            result_path: row.try_get("result_path")?,
            report_path: row.try_get("report_path")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            lease_token: row.try_get("lease_token")?,
            history: row.try_get("history")?,
            analysis_status: row.try_get("analysis_status")?,
            analysis_output: row.try_get("analysis_output")?,
            analysis_error: row.try_get("analysis_error")?,
            analysis_started_at: row.try_get("analysis_started_at")?,
            analysis_completed_at: row.try_get("analysis_completed_at")?,
            analysis_elapsed_ms: row.try_get("analysis_elapsed_ms")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl JobRow {
    fn analysis_block(&self, job_id: JobId) -> Result<AnalysisBlock, JobStoreError> {
        let corrupt = |what: &str, e: String| JobStoreError::Invariant {
            job_id,
            reason: format!("unreadable {what}: {e}"),
        };
        let status: AnalysisStatus = self
            .analysis_status
            .parse()
            .map_err(|e: backtestq_core::DomainError| corrupt("analysis_status", e.to_string()))?;
        let output = self
            .analysis_output
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt("analysis_output", e.to_string()))?;

        Ok(AnalysisBlock {
            status,
            output,
            error: self.analysis_error.clone(),
            started_at: self.analysis_started_at,
            completed_at: self.analysis_completed_at,
            elapsed_ms: self.analysis_elapsed_ms.map(|ms| ms as u64),
        })
    }

    fn into_job(self) -> Result<Job, JobStoreError> {
        let job_id = JobId::from_uuid(self.id);
        let corrupt = |what: &str, e: String| JobStoreError::Invariant {
            job_id,
            reason: format!("unreadable {what}: {e}"),
        };

        let analysis = self.analysis_block(job_id)?;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: backtestq_core::DomainError| corrupt("status", e.to_string()))?;
        let output: Option<AnalysisOutput> = self
            .output
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt("output", e.to_string()))?;
        let history: Vec<AttemptRecord> =
            serde_json::from_value(self.history).map_err(|e| corrupt("history", e.to_string()))?;
        let artifacts = self.result_path.map(|result_path| Artifacts {
            result_path,
            report_path: self.report_path,
        });

        Ok(Job {
            id: job_id,
            status,
            input: self.input,
            output,
            artifacts,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            error_message: self.error_message,
            lease: self.lease_token.map(LeaseToken::from_uuid),
            history,
            analysis,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    //! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

    use super::*;
    use backtestq_core::{Finding, OutputSummary, ReasonCode, Stage};

    async fn store() -> PgJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        let store = PgJobStore::new(pool);
        store.ensure_schema().await.expect("schema");
        store
    }

    #[test]
    fn database_error_codes_map_as_documented() {
        assert!(matches!(
            classify_db_error(Some("40001"), "serialization".into()),
            JobStoreError::ClaimConflict(_)
        ));
        assert!(matches!(
            classify_db_error(Some("55P03"), "lock".into()),
            JobStoreError::ClaimConflict(_)
        ));
        match classify_db_error(Some("23514"), "analysis_jobs_status_check".into()) {
            JobStoreError::Storage(msg) => assert!(msg.starts_with("check constraint violated")),
            other => panic!("expected storage error, got {other:?}"),
        }
        assert!(matches!(classify_db_error(None, "io".into()), JobStoreError::Storage(_)));
    }

    fn output() -> AnalysisOutput {
        AnalysisOutput::new(OutputSummary {
            total_return: 3.0,
            annualized_return: 3.0,
            mdd: 2.0,
            sharpe_ratio: 0.5,
            win_rate: 50.0,
            total_trades: 4,
            total_profit: 10.0,
            total_loss: 5.0,
        })
    }

    /// Claim until the job we enqueued comes up; other pending rows are failed
    /// so they stop competing.
    async fn claim(store: &PgJobStore, job_id: JobId) -> Job {
        loop {
            let job = store.claim_next_pending().await.unwrap().expect("job claimable");
            if job.id == job_id {
                return job;
            }
            let lease = job.lease().unwrap();
            let record = AttemptRecord::new(job.retry_count, Stage::Finalize, vec![]);
            store
                .persist_failed(
                    &lease,
                    Failure {
                        error_message: "invalid_input: cleared by test".into(),
                        retry_count: job.retry_count,
                        record,
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn enqueue_claim_complete_roundtrip() {
        let store = store().await;
        let job_id = store.enqueue(NewJob::new(serde_json::json!({"target_symbols": ["005930"]}))).await.unwrap();

        let job = claim(&store, job_id).await;
        assert_eq!(job.status, JobStatus::InProgress);
        let lease = job.lease().unwrap();

        store.touch(&lease).await.unwrap();
        store
            .persist_completed(&lease, Completion { output: output(), artifacts: None })
            .await
            .unwrap();

        let stored = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.output, Some(output()));
        assert!(stored.lease.is_none());

        let err = store
            .persist_completed(&lease, Completion { output: output(), artifacts: None })
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn retry_appends_history_and_guards_budget() {
        let store = store().await;
        let job_id = store
            .enqueue(NewJob::new(serde_json::json!({})).with_max_retries(1))
            .await
            .unwrap();
        let lease = claim(&store, job_id).await.lease().unwrap();

        let record = AttemptRecord::new(
            1,
            Stage::Execute,
            vec![Finding::blocking(ReasonCode::ExecutionFailed, "boom")],
        );
        let update = |retry_count| RetryUpdate {
            input: serde_json::json!({"target_symbols": ["000660"]}),
            retry_count,
            record: record.clone(),
            requeue: false,
        };
        store.persist_retry(&lease, update(1)).await.unwrap();
        let err = store.persist_retry(&lease, update(2)).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Invariant { .. }));

        let stored = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.history, vec![record]);
    }
}
