//! Result artifacts written next to a completed job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use backtestq_core::{AnalysisOutput, Artifacts, JobId};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persists a completed output outside the job row.
///
/// Called after the audit passed and before the job is finalized; a failure
/// fails the job.
#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    /// Returns the stored locations, or `None` when nothing is kept.
    async fn write(&self, job_id: JobId, output: &AnalysisOutput) -> Result<Option<Artifacts>, ArtifactError>;
}

/// Writes `<dir>/<job_id>.json` and, when the output carries a report,
/// `<dir>/<job_id>.md`.
#[derive(Debug, Clone)]
pub struct FsArtifactWriter {
    dir: PathBuf,
}

impl FsArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), ArtifactError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })
}

#[async_trait]
impl ArtifactWriter for FsArtifactWriter {
    async fn write(&self, job_id: JobId, output: &AnalysisOutput) -> Result<Option<Artifacts>, ArtifactError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.dir.display().to_string(),
                source,
            })?;

        let result_path = self.dir.join(format!("{job_id}.json"));
        write_file(&result_path, &serde_json::to_vec_pretty(output)?).await?;

        let report_path = match &output.report {
            Some(report) => {
                let path = self.dir.join(format!("{job_id}.md"));
                write_file(&path, report.as_bytes()).await?;
                Some(path.display().to_string())
            }
            None => None,
        };

        debug!(job_id = %job_id, path = %result_path.display(), "artifacts written");
        Ok(Some(Artifacts {
            result_path: result_path.display().to_string(),
            report_path,
        }))
    }
}

/// Keeps nothing; the output lives only in the job row.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardArtifacts;

#[async_trait]
impl ArtifactWriter for DiscardArtifacts {
    async fn write(&self, _job_id: JobId, _output: &AnalysisOutput) -> Result<Option<Artifacts>, ArtifactError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backtestq_core::OutputSummary;

    fn output() -> AnalysisOutput {
        AnalysisOutput::new(OutputSummary {
            total_return: 8.0,
            annualized_return: 8.0,
            mdd: 3.5,
            sharpe_ratio: 1.2,
            win_rate: 61.0,
            total_trades: 14,
            total_profit: 2_000_000.0,
            total_loss: 500_000.0,
        })
    }

    #[tokio::test]
    async fn writes_result_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsArtifactWriter::new(dir.path().join("results"));
        let job_id = JobId::new();

        let artifacts = writer
            .write(job_id, &output().with_report("# Report\n"))
            .await
            .unwrap()
            .unwrap();

        let json = std::fs::read_to_string(&artifacts.result_path).unwrap();
        let decoded: AnalysisOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.summary.total_trades, 14);
        assert!(artifacts.result_path.ends_with(&format!("{job_id}.json")));

        let report_path = artifacts.report_path.unwrap();
        assert_eq!(std::fs::read_to_string(report_path).unwrap(), "# Report\n");
    }

    #[tokio::test]
    async fn no_report_means_no_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsArtifactWriter::new(dir.path());

        let artifacts = writer.write(JobId::new(), &output()).await.unwrap().unwrap();
        assert!(artifacts.report_path.is_none());
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let writer = FsArtifactWriter::new(&blocker);
        let err = writer.write(JobId::new(), &output()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
    }
}
