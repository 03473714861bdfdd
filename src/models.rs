//! Data models for the insight pipeline.
//!
//! This module contains the core data structures shared by the collector,
//! the memory store, the analyzer and the report builder: tracked entities,
//! their append-only history, per-run analysis results and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// External provider an entity was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Code hosting (repositories).
    Github,
    /// Model hub.
    Huggingface,
    /// Preprint archive.
    Arxiv,
    /// Vendor model-listing APIs.
    Vendor,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Github => "github",
            SourceKind::Huggingface => "huggingface",
            SourceKind::Arxiv => "arxiv",
            SourceKind::Vendor => "vendor",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "github" => Ok(SourceKind::Github),
            "huggingface" | "hf" => Ok(SourceKind::Huggingface),
            "arxiv" => Ok(SourceKind::Arxiv),
            "vendor" => Ok(SourceKind::Vendor),
            other => Err(format!(
                "unknown source '{}' (expected github, huggingface, arxiv or vendor)",
                other
            )),
        }
    }
}

/// What kind of thing an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Repository,
    Model,
    Paper,
}

impl EntityKind {
    /// Models and the repositories implementing them get per-model detail reports.
    pub fn is_model_adjacent(&self) -> bool {
        matches!(self, EntityKind::Model | EntityKind::Repository)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Repository => write!(f, "repository"),
            EntityKind::Model => write!(f, "model"),
            EntityKind::Paper => write!(f, "paper"),
        }
    }
}

/// Identity of an entity: unique across all sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub source: SourceKind,
    pub external_id: String,
}

impl EntityRef {
    pub fn new(source: SourceKind, external_id: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// Current view of a tracked repository, model or paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub source: SourceKind,
    pub external_id: String,
    pub kind: EntityKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Hash over the observable content; changes iff the content changed.
    pub fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_analyzed_at: Option<DateTime<Utc>>,
    /// Fingerprint of the state covered by the last successful analysis.
    pub analyzed_fingerprint: Option<String>,
}

impl Entity {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.source, self.external_id.clone())
    }

    /// True when the current state has never been analyzed successfully.
    pub fn needs_analysis(&self) -> bool {
        self.analyzed_fingerprint.as_deref() != Some(self.fingerprint.as_str())
    }
}

/// A normalized observation of an entity, ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub source: SourceKind,
    pub external_id: String,
    pub kind: EntityKind,
    pub title: String,
    pub url: Option<String>,
    pub fingerprint: String,
    pub snapshot: Value,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.source, self.external_id.clone())
    }
}

/// Append-only record of an entity's state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub entity: EntityRef,
    pub observed_at: DateTime<Utc>,
    pub fingerprint: String,
    /// Provider payload as observed, opaque to the pipeline.
    pub snapshot: Value,
}

/// Outcome of analyzing one entity in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Success => write!(f, "success"),
            AnalysisStatus::Failed => write!(f, "failed"),
            AnalysisStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A named finding produced by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

/// Analyzer output for one entity at one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub entity: EntityRef,
    pub run_id: RunId,
    pub kind: EntityKind,
    pub title: String,
    /// Fingerprint of the entity state that was analyzed.
    pub fingerprint: String,
    pub summary: String,
    #[serde(default)]
    pub derived_metrics: BTreeMap<String, MetricValue>,
    pub status: AnalysisStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn is_success(&self) -> bool {
        self.status == AnalysisStatus::Success
    }
}

/// Identifier of one pipeline run: milliseconds since the epoch, strictly
/// increasing across runs recorded in the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    pub fn from_time(at: DateTime<Utc>) -> Self {
        RunId(at.timestamp_millis().max(0) as u64)
    }

    /// Bump this id so it sorts after `previous`.
    pub fn after(self, previous: RunId) -> Self {
        if self > previous {
            self
        } else {
            RunId(previous.0 + 1)
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Full,
    CollectOnly,
    AnalyzeOnly,
    ReportOnly,
}

impl RunMode {
    pub fn includes(&self, stage: Stage) -> bool {
        match self {
            RunMode::Full => true,
            RunMode::CollectOnly => stage == Stage::Collecting,
            RunMode::AnalyzeOnly => stage == Stage::Analyzing,
            RunMode::ReportOnly => stage == Stage::Reporting,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::CollectOnly => write!(f, "collect-only"),
            RunMode::AnalyzeOnly => write!(f, "analyze-only"),
            RunMode::ReportOnly => write!(f, "report-only"),
        }
    }
}

/// A stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Collecting,
    Analyzing,
    Reporting,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Collecting, Stage::Analyzing, Stage::Reporting];

    pub fn phase(&self) -> RunPhase {
        match self {
            Stage::Collecting => RunPhase::Collecting,
            Stage::Analyzing => RunPhase::Analyzing,
            Stage::Reporting => RunPhase::Reporting,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Collecting => write!(f, "collecting"),
            Stage::Analyzing => write!(f, "analyzing"),
            Stage::Reporting => write!(f, "reporting"),
        }
    }
}

/// Resolution of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Ok,
    Partial,
    Failed,
    Cancelled,
    Skipped,
}

impl StageStatus {
    /// Whether this status degrades the overall run to partial.
    pub fn degrades_run(&self) -> bool {
        matches!(
            self,
            StageStatus::Partial | StageStatus::Failed | StageStatus::Cancelled
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Ok => "ok",
            StageStatus::Partial => "partial",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Status and error count of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub status: StageStatus,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageReport {
    pub fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            errors: 0,
            detail: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// How one source fared during collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Ok,
    /// Rate limited; resumes from the saved cursor on the next run.
    Deferred,
    Failed,
}

/// A source's contribution to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub status: SourceStatus,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub pages: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Default for SourceReport {
    fn default() -> Self {
        Self {
            status: SourceStatus::Ok,
            new: 0,
            changed: 0,
            unchanged: 0,
            pages: 0,
            errors: 0,
            last_error: None,
            retry_after_secs: None,
        }
    }
}

/// State machine position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Started,
    Collecting,
    Analyzing,
    Reporting,
    Completed,
    FailedFatal,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Partial,
    FailedFatal,
}

impl RunStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Ok => 0,
            RunStatus::Partial => 2,
            RunStatus::Running | RunStatus::FailedFatal => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::FailedFatal => write!(f, "failed_fatal"),
        }
    }
}

/// One pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub mode: RunMode,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stage_statuses: BTreeMap<Stage, StageReport>,
    #[serde(default)]
    pub sources: BTreeMap<SourceKind, SourceReport>,
    pub collected_count: usize,
    pub analyzed_count: usize,
    pub failed_count: usize,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    /// Creates a run in the `Started` phase. Stages outside `mode` are skipped.
    pub fn new(run_id: RunId, mode: RunMode, started_at: DateTime<Utc>) -> Self {
        let stage_statuses = Stage::ALL
            .iter()
            .map(|stage| {
                let status = if mode.includes(*stage) {
                    StageStatus::Pending
                } else {
                    StageStatus::Skipped
                };
                (*stage, StageReport::with_status(status))
            })
            .collect();

        Self {
            run_id,
            mode,
            phase: RunPhase::Started,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            stage_statuses,
            sources: BTreeMap::new(),
            collected_count: 0,
            analyzed_count: 0,
            failed_count: 0,
            cancelled: false,
            error: None,
        }
    }

    pub fn stage(&self, stage: Stage) -> StageStatus {
        self.stage_statuses
            .get(&stage)
            .map(|r| r.status)
            .unwrap_or(StageStatus::Pending)
    }

    /// Marks `stage` as running.
    pub fn begin_stage(&mut self, stage: Stage, now: DateTime<Utc>) {
        self.phase = stage.phase();
        let report = self
            .stage_statuses
            .entry(stage)
            .or_insert_with(|| StageReport::with_status(StageStatus::Pending));
        report.started_at = Some(now);
    }

    /// Records the resolution of `stage`, keeping its start time.
    pub fn finish_stage(&mut self, stage: Stage, mut report: StageReport, now: DateTime<Utc>) {
        if let Some(existing) = self.stage_statuses.get(&stage) {
            report.started_at = report.started_at.or(existing.started_at);
        }
        report.completed_at = Some(now);
        self.stage_statuses.insert(stage, report);
    }

    /// Marks every still-pending stage as cancelled.
    pub fn cancel_pending(&mut self) {
        self.cancelled = true;
        for report in self.stage_statuses.values_mut() {
            if report.status == StageStatus::Pending {
                report.status = StageStatus::Cancelled;
            }
        }
    }

    /// Moves the run to the fatal terminal state.
    pub fn fail_fatal(&mut self, error: impl Into<String>) {
        self.phase = RunPhase::FailedFatal;
        self.error = Some(error.into());
        for report in self.stage_statuses.values_mut() {
            if report.status == StageStatus::Pending {
                report.status = StageStatus::Failed;
            }
        }
    }

    /// Computes the overall status and stamps the completion time.
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        if self.phase == RunPhase::FailedFatal {
            self.status = RunStatus::FailedFatal;
            return;
        }

        self.phase = RunPhase::Completed;
        let degraded = self.cancelled
            || self
                .stage_statuses
                .values()
                .any(|report| report.status.degrades_run());
        self.status = if degraded {
            RunStatus::Partial
        } else {
            RunStatus::Ok
        };
    }
}
