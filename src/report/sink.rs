//! Report hand-off.

use super::ReportPayload;
use crate::error::ReportError;
use crate::models::RunId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Destination for a run's report payloads.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver `payloads`; returns how many were written.
    async fn emit(&self, run_id: RunId, payloads: &[ReportPayload]) -> Result<usize, ReportError>;
}

/// Writes each payload as pretty JSON to `{root}/{run_id}/{stem}.json`.
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ReportError {
    ReportError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn emit(&self, run_id: RunId, payloads: &[ReportPayload]) -> Result<usize, ReportError> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        for payload in payloads {
            let path = dir.join(format!("{}.json", payload.file_stem()));
            let json = serde_json::to_string_pretty(payload)?;
            std::fs::write(&path, json).map_err(|e| io_error(&path, e))?;
        }

        info!("Wrote {} reports to {}", payloads.len(), dir.display());
        Ok(payloads.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunMode, RunRecord};
    use crate::report::build_reports;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_payloads_under_run_dir() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path());
        let run = RunRecord::new(RunId(42), RunMode::Full, Utc::now());
        let payloads = build_reports(&run, &[]);

        let written = sink.emit(RunId(42), &payloads).await.unwrap();
        assert_eq!(written, 1);

        let path = dir.path().join("run-42").join("trend.json");
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: ReportPayload = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, payloads[0]);
        assert!(content.contains("\"type\": \"trend\""));
    }

    #[tokio::test]
    async fn test_unwritable_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let sink = JsonFileSink::new(&blocker);
        let run = RunRecord::new(RunId(1), RunMode::Full, Utc::now());
        let err = sink.emit(RunId(1), &build_reports(&run, &[])).await.unwrap_err();
        assert!(matches!(err, ReportError::Io { .. }));
    }
}
