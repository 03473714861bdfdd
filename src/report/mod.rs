//! Report payloads.
//!
//! Payloads are renderer-agnostic: they reference analysis results and run
//! metadata only. Rendering to Markdown, HTML or slides happens downstream
//! of the [`ReportSink`].

pub mod builder;
pub mod sink;

use crate::fingerprint::fingerprint;
use crate::models::{
    EntityKind, EntityRef, MetricValue, RunId, RunMode, RunRecord, RunStatus, SourceKind, Stage,
    StageStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

pub use builder::build_reports;
pub use sink::{JsonFileSink, ReportSink};

/// One report handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportPayload {
    Trend(TrendReport),
    ModelDetail(ModelReport),
}

impl ReportPayload {
    /// File-system friendly name, unique within one run. Model stems carry
    /// a readable (lossy) form of the id plus a digest of the full entity
    /// ref, so ids that sanitize alike still get distinct files.
    pub fn file_stem(&self) -> String {
        match self {
            ReportPayload::Trend(_) => "trend".to_string(),
            ReportPayload::ModelDetail(detail) => {
                let id: String = detail
                    .entity
                    .external_id
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
                    .collect();
                let digest = fingerprint(&json!([detail.entity.source, detail.entity.external_id]));
                format!("model-{}-{}-{}", detail.entity.source, id, &digest[..8])
            }
        }
    }
}

/// Run metadata carried by every trend report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub collected_count: usize,
    pub analyzed_count: usize,
    pub failed_count: usize,
    pub cancelled: bool,
    pub stages: BTreeMap<Stage, StageStatus>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id,
            mode: run.mode,
            status: run.status,
            started_at: run.started_at,
            completed_at: run.completed_at,
            collected_count: run.collected_count,
            analyzed_count: run.analyzed_count,
            failed_count: run.failed_count,
            cancelled: run.cancelled,
            stages: run
                .stage_statuses
                .iter()
                .map(|(stage, report)| (*stage, report.status))
                .collect(),
        }
    }
}

/// Result counts by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub results: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// A successful analysis worth surfacing in the trend report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub entity: EntityRef,
    pub kind: EntityKind,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub entity: EntityRef,
    pub title: String,
    pub error: Option<String>,
}

/// Results that did not succeed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSection {
    pub count: usize,
    pub items: Vec<FailureEntry>,
}

/// Cross-entity view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub run: RunSummary,
    pub totals: Totals,
    /// Successful results per source.
    pub by_source: BTreeMap<SourceKind, usize>,
    /// Successful results per entity kind.
    pub by_kind: BTreeMap<EntityKind, usize>,
    pub highlights: Vec<Highlight>,
    /// Mean of every numeric metric across successful results.
    pub metric_averages: BTreeMap<String, f64>,
    pub failures: FailureSection,
}

/// Per-model (or per-repository) detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub run_id: RunId,
    pub entity: EntityRef,
    pub kind: EntityKind,
    pub title: String,
    pub summary: String,
    pub metrics: BTreeMap<String, MetricValue>,
    pub analyzed_at: DateTime<Utc>,
    pub attempts: u32,
}
