//! Pipeline orchestration: collect → analyze → report.
//!
//! The run record moves through `Started → Collecting → Analyzing →
//! Reporting → Completed` and is persisted at every transition. Source and
//! analysis failures degrade a stage to `partial`; only store failures end
//! the run in `FailedFatal`. Cancellation is honoured between stages.

use crate::analysis::{AnalyzeTally, Analyzer};
use crate::collector::{CollectBatch, Collector};
use crate::error::StoreError;
use crate::models::{
    AnalysisResult, Entity, EntityRef, RunId, RunMode, RunRecord, Stage, StageReport, StageStatus,
};
use crate::report::{build_reports, ReportSink};
use crate::store::MemoryStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How many past runs report-only mode looks through.
const REPORT_LOOKBACK: usize = 50;

/// Per-stage ceilings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub collect_timeout: Duration,
    pub analyze_timeout: Duration,
    pub report_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            collect_timeout: Duration::from_secs(600),
            analyze_timeout: Duration::from_secs(1800),
            report_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn MemoryStore>,
    collector: Collector,
    analyzer: Analyzer,
    sink: Arc<dyn ReportSink>,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        collector: Collector,
        analyzer: Analyzer,
        sink: Arc<dyn ReportSink>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            collector,
            analyzer,
            sink,
            settings,
            cancel,
        }
    }

    /// Execute one run in `mode` and return its final record.
    ///
    /// Never fails: a fatal problem is reported through the record's status.
    pub async fn run_pipeline(&self, mode: RunMode) -> RunRecord {
        let started = Utc::now();

        if let Err(e) = self.store.health_check().await {
            error!("Memory store unavailable, aborting run: {}", e);
            let mut run = RunRecord::new(RunId::from_time(started), mode, started);
            run.fail_fatal(e.to_string());
            run.finalize(Utc::now());
            return run;
        }

        let run_id = match self.store.recent_runs(1).await {
            Ok(previous) => previous
                .first()
                .map(|p| RunId::from_time(started).after(p.run_id))
                .unwrap_or_else(|| RunId::from_time(started)),
            Err(e) => {
                let mut run = RunRecord::new(RunId::from_time(started), mode, started);
                run.fail_fatal(e.to_string());
                run.finalize(Utc::now());
                return run;
            }
        };

        let mut run = RunRecord::new(run_id, mode, started);
        info!("Starting {} ({} mode)", run_id, mode);

        if let Err(e) = self.execute(&mut run).await {
            error!("{} failed: {}", run_id, e);
            run.fail_fatal(e.to_string());
        }

        run.finalize(Utc::now());
        if let Err(e) = self.store.save_run(&run).await {
            error!("Failed to persist final state of {}: {}", run_id, e);
            run.fail_fatal(e.to_string());
            run.finalize(Utc::now());
        }

        info!(
            "{} finished: status {}, collected {}, analyzed {}, failed {}",
            run_id, run.status, run.collected_count, run.analyzed_count, run.failed_count
        );
        run
    }

    async fn execute(&self, run: &mut RunRecord) -> Result<(), StoreError> {
        self.store.save_run(run).await?;

        let mut collected = Vec::new();
        if run.stage(Stage::Collecting) == StageStatus::Pending {
            if self.stop_if_cancelled(run) {
                return Ok(());
            }
            self.begin(run, Stage::Collecting).await?;
            collected = self.collect_stage(run).await?;
            self.store.save_run(run).await?;
        }

        if run.stage(Stage::Analyzing) == StageStatus::Pending {
            if self.stop_if_cancelled(run) {
                return Ok(());
            }
            self.begin(run, Stage::Analyzing).await?;
            self.analyze_stage(run, collected).await?;
            self.store.save_run(run).await?;
        }

        if run.stage(Stage::Reporting) == StageStatus::Pending {
            if self.stop_if_cancelled(run) {
                return Ok(());
            }
            self.begin(run, Stage::Reporting).await?;
            self.report_stage(run).await?;
            self.store.save_run(run).await?;
        }

        Ok(())
    }

    fn stop_if_cancelled(&self, run: &mut RunRecord) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        warn!("{} cancelled, skipping remaining stages", run.run_id);
        run.cancel_pending();
        true
    }

    async fn begin(&self, run: &mut RunRecord, stage: Stage) -> Result<(), StoreError> {
        info!("{}: {} stage started", run.run_id, stage);
        run.begin_stage(stage, Utc::now());
        self.store.save_run(run).await
    }

    async fn collect_stage(&self, run: &mut RunRecord) -> Result<Vec<Entity>, StoreError> {
        let mut batch = CollectBatch::default();
        let outcome =
            tokio::time::timeout(self.settings.collect_timeout, self.collector.collect(&mut batch))
                .await;

        let mut report = StageReport::with_status(batch.stage_status());
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Collecting timed out after {}s",
                    self.settings.collect_timeout.as_secs()
                );
                report.status = StageStatus::Partial;
                report.detail = Some(format!(
                    "timed out after {}s",
                    self.settings.collect_timeout.as_secs()
                ));
            }
        }
        report.errors = batch.error_count();

        run.collected_count = batch.entities.len();
        run.sources = batch.sources;
        run.finish_stage(Stage::Collecting, report, Utc::now());
        Ok(batch.entities)
    }

    async fn analyze_stage(
        &self,
        run: &mut RunRecord,
        collected: Vec<Entity>,
    ) -> Result<(), StoreError> {
        let targets = merge_pending(collected, self.store.pending_analysis().await?);

        let mut tally = AnalyzeTally::default();
        let outcome = tokio::time::timeout(
            self.settings.analyze_timeout,
            self.analyzer.analyze(run.run_id, &targets, &mut tally),
        )
        .await;

        let mut report = StageReport::with_status(if tally.failed > 0 {
            StageStatus::Partial
        } else {
            StageStatus::Ok
        });
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Analyzing timed out after {}s ({} of {} done)",
                    self.settings.analyze_timeout.as_secs(),
                    tally.processed,
                    targets.len()
                );
                report.status = StageStatus::Partial;
                report.detail = Some(format!(
                    "timed out after {}s with {} of {} entities analyzed",
                    self.settings.analyze_timeout.as_secs(),
                    tally.processed,
                    targets.len()
                ));
            }
        }
        report.errors = tally.failed;

        run.analyzed_count = tally.processed;
        run.failed_count = tally.failed;
        run.finish_stage(Stage::Analyzing, report, Utc::now());
        Ok(())
    }

    async fn report_stage(&self, run: &mut RunRecord) -> Result<(), StoreError> {
        let source = if run.mode == RunMode::ReportOnly {
            self.latest_reportable_run(run.run_id).await?
        } else {
            let results = self.store.analysis_for_run(run.run_id).await?;
            Some((run.clone(), results))
        };

        let Some((source_run, results)) = source else {
            let mut report = StageReport::with_status(StageStatus::Ok);
            report.detail = Some("no analysis results to report".to_string());
            run.finish_stage(Stage::Reporting, report, Utc::now());
            return Ok(());
        };

        let payloads = build_reports(&source_run, &results);
        let outcome = tokio::time::timeout(
            self.settings.report_timeout,
            self.sink.emit(source_run.run_id, &payloads),
        )
        .await;

        let report = match outcome {
            Ok(Ok(written)) => {
                let mut report = StageReport::with_status(StageStatus::Ok);
                report.detail = Some(format!(
                    "{} reports for {}",
                    written, source_run.run_id
                ));
                report
            }
            Ok(Err(e)) => {
                warn!("Report sink failed: {}", e);
                let mut report = StageReport::with_status(StageStatus::Partial);
                report.errors = 1;
                report.detail = Some(e.to_string());
                report
            }
            Err(_) => {
                warn!("Reporting timed out");
                let mut report = StageReport::with_status(StageStatus::Partial);
                report.errors = 1;
                report.detail = Some(format!(
                    "timed out after {}s",
                    self.settings.report_timeout.as_secs()
                ));
                report
            }
        };
        run.finish_stage(Stage::Reporting, report, Utc::now());
        Ok(())
    }

    /// Most recent earlier run that recorded analysis results.
    async fn latest_reportable_run(
        &self,
        current: RunId,
    ) -> Result<Option<(RunRecord, Vec<AnalysisResult>)>, StoreError> {
        for candidate in self.store.recent_runs(REPORT_LOOKBACK).await? {
            if candidate.run_id == current {
                continue;
            }
            let results = self.store.analysis_for_run(candidate.run_id).await?;
            if !results.is_empty() {
                info!("Reporting on {}", candidate.run_id);
                return Ok(Some((candidate, results)));
            }
        }
        Ok(None)
    }
}

/// Collected entities first, then pending ones not already included.
fn merge_pending(collected: Vec<Entity>, pending: Vec<Entity>) -> Vec<Entity> {
    let mut seen: HashSet<EntityRef> = collected.iter().map(|e| e.entity_ref()).collect();
    let mut targets = collected;
    for entity in pending {
        if seen.insert(entity.entity_ref()) {
            targets.push(entity);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerConfig;
    use crate::collector::CollectorConfig;
    use crate::error::SourceError;
    use crate::llm::LlmClient;
    use crate::models::{AnalysisStatus, RunPhase, RunStatus, SourceKind, SourceStatus};
    use crate::report::ReportPayload;
    use crate::sources::{Page, SourceAdapter};
    use crate::store::JournalStore;
    use crate::testing::{instant_retry, repo_item, FakeLlm, FakeSource, MemorySink, UnavailableStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;

    const GOOD_REPLY: &str = r#"{"summary": "Notable release.", "metrics": {"novelty": 5}}"#;

    fn pipeline(
        store: Arc<dyn MemoryStore>,
        sources: Vec<Arc<dyn SourceAdapter>>,
        llm: Arc<dyn LlmClient>,
        sink: Arc<MemorySink>,
        cancel: CancellationToken,
    ) -> Pipeline {
        let collector = Collector::new(
            store.clone(),
            sources,
            CollectorConfig {
                retry: instant_retry(2),
                ..CollectorConfig::default()
            },
        );
        let analyzer = Analyzer::new(
            store.clone(),
            llm,
            AnalyzerConfig {
                retry: instant_retry(2),
                ..AnalyzerConfig::default()
            },
        );
        Pipeline::new(store, collector, analyzer, sink, PipelineSettings::default(), cancel)
    }

    fn three_repos() -> Arc<dyn SourceAdapter> {
        Arc::new(FakeSource::items(
            SourceKind::Github,
            vec![
                repo_item("openai/whisper", "speech"),
                repo_item("karpathy/nanoGPT", "gpt"),
                repo_item("huggingface/transformers", "models"),
            ],
        ))
    }

    fn empty_arxiv() -> Arc<dyn SourceAdapter> {
        Arc::new(FakeSource::items(SourceKind::Arxiv, vec![]))
    }

    fn trend(payloads: &[ReportPayload]) -> &crate::report::TrendReport {
        match &payloads[0] {
            ReportPayload::Trend(t) => t,
            other => panic!("expected trend first, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_run_with_new_repositories() {
        let store = Arc::new(JournalStore::in_memory());
        let sink = Arc::new(MemorySink::default());
        let p = pipeline(
            store.clone(),
            vec![three_repos(), empty_arxiv()],
            Arc::new(FakeLlm::replying(GOOD_REPLY)),
            sink.clone(),
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::Full).await;

        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.phase, RunPhase::Completed);
        assert_eq!(run.collected_count, 3);
        assert_eq!(run.analyzed_count, 3);
        assert_eq!(run.failed_count, 0);
        assert_eq!(run.sources[&SourceKind::Arxiv].new, 0);

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1);
        let payloads = &emitted[0].1;
        assert_eq!(payloads.len(), 4);
        assert_eq!(trend(payloads).failures.count, 0);
        assert_eq!(
            payloads
                .iter()
                .filter(|p| matches!(p, ReportPayload::ModelDetail(_)))
                .count(),
            3
        );

        let saved = store.recent_runs(1).await.unwrap();
        assert_eq!(saved[0], run);
    }

    #[tokio::test]
    async fn test_rerun_without_changes_does_nothing_new() {
        let store = Arc::new(JournalStore::in_memory());
        let sink = Arc::new(MemorySink::default());
        let llm = Arc::new(FakeLlm::replying(GOOD_REPLY));
        let p = pipeline(
            store.clone(),
            vec![three_repos(), empty_arxiv()],
            llm.clone(),
            sink.clone(),
            CancellationToken::new(),
        );

        let first = p.run_pipeline(RunMode::Full).await;
        let second = p.run_pipeline(RunMode::Full).await;

        assert!(second.run_id > first.run_id);
        assert_eq!(second.status, RunStatus::Ok);
        assert_eq!(second.collected_count, 0);
        assert_eq!(second.analyzed_count, 0);
        assert_eq!(second.sources[&SourceKind::Github].unchanged, 3);
        assert_eq!(llm.calls(), 3);

        let key = EntityRef::new(SourceKind::Github, "openai/whisper");
        assert_eq!(store.get_history(&key, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_source_makes_run_partial() {
        let store = Arc::new(JournalStore::in_memory());
        let p = pipeline(
            store.clone(),
            vec![
                three_repos(),
                Arc::new(FakeSource::unavailable(SourceKind::Arxiv)),
            ],
            Arc::new(FakeLlm::replying(GOOD_REPLY)),
            Arc::new(MemorySink::default()),
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::Full).await;

        assert_eq!(run.stage(Stage::Collecting), StageStatus::Partial);
        assert_eq!(run.sources[&SourceKind::Arxiv].status, SourceStatus::Failed);
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.status.exit_code(), 2);
        assert_eq!(run.analyzed_count, 3);
        assert!(store.get_watermark(SourceKind::Arxiv).await.unwrap().is_none());
        assert!(store.get_watermark(SourceKind::Github).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_analysis_excluded_from_details() {
        let store = Arc::new(JournalStore::in_memory());
        let sink = Arc::new(MemorySink::default());
        let llm = FakeLlm::new(|_, prompt| {
            if prompt.contains("karpathy/nanoGPT") {
                Err(crate::error::LlmError::Timeout(30))
            } else {
                Ok(GOOD_REPLY.to_string())
            }
        });
        let p = pipeline(
            store.clone(),
            vec![three_repos()],
            Arc::new(llm),
            sink.clone(),
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::Full).await;
        assert_eq!(run.failed_count, 1);
        assert_eq!(run.stage(Stage::Analyzing), StageStatus::Partial);

        let key = EntityRef::new(SourceKind::Github, "karpathy/nanoGPT");
        let latest = store.get_latest_analysis(&key).await.unwrap().unwrap();
        assert_eq!(latest.status, AnalysisStatus::Failed);

        let payloads = &sink.emitted()[0].1;
        assert_eq!(trend(payloads).failures.count, 1);
        assert!(payloads.iter().all(|p| match p {
            ReportPayload::ModelDetail(d) => d.entity != key,
            ReportPayload::Trend(_) => true,
        }));
    }

    /// Cancels the run's token while it is being fetched.
    struct CancellingSource {
        inner: FakeSource,
        token: CancellationToken,
    }

    #[async_trait]
    impl SourceAdapter for CancellingSource {
        fn kind(&self) -> SourceKind {
            self.inner.kind()
        }

        async fn fetch(
            &self,
            since: Option<DateTime<Utc>>,
            cursor: Option<&str>,
        ) -> Result<Page, SourceError> {
            self.token.cancel();
            self.inner.fetch(since, cursor).await
        }
    }

    #[tokio::test]
    async fn test_cancel_after_collecting() {
        let store = Arc::new(JournalStore::in_memory());
        let token = CancellationToken::new();
        let source = Arc::new(CancellingSource {
            inner: FakeSource::items(SourceKind::Github, vec![repo_item("openai/whisper", "x")]),
            token: token.clone(),
        });
        let llm = Arc::new(FakeLlm::replying(GOOD_REPLY));
        let sink = Arc::new(MemorySink::default());
        let p = pipeline(store.clone(), vec![source], llm.clone(), sink.clone(), token);

        let run = p.run_pipeline(RunMode::Full).await;

        assert_eq!(run.stage(Stage::Collecting), StageStatus::Ok);
        assert_eq!(run.stage(Stage::Analyzing), StageStatus::Cancelled);
        assert_eq!(run.stage(Stage::Reporting), StageStatus::Cancelled);
        assert_eq!(run.status, RunStatus::Partial);
        assert!(run.cancelled);
        assert_eq!(llm.calls(), 0);
        assert!(sink.emitted().is_empty());
        assert!(store.get_watermark(SourceKind::Github).await.unwrap().is_some());

        let saved = store.recent_runs(1).await.unwrap();
        assert_eq!(saved[0].status, RunStatus::Partial);
        assert_eq!(store.pending_analysis().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_unavailable_is_fatal() {
        let source = Arc::new(FakeSource::items(SourceKind::Github, vec![]));
        let p = pipeline(
            Arc::new(UnavailableStore),
            vec![source.clone()],
            Arc::new(FakeLlm::replying(GOOD_REPLY)),
            Arc::new(MemorySink::default()),
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::Full).await;

        assert_eq!(run.status, RunStatus::FailedFatal);
        assert_eq!(run.status.exit_code(), 1);
        assert!(run.error.is_some());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_collect_only_leaves_entities_pending() {
        let store = Arc::new(JournalStore::in_memory());
        let llm = Arc::new(FakeLlm::replying(GOOD_REPLY));
        let p = pipeline(
            store.clone(),
            vec![three_repos()],
            llm.clone(),
            Arc::new(MemorySink::default()),
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::CollectOnly).await;
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.stage(Stage::Analyzing), StageStatus::Skipped);
        assert_eq!(run.stage(Stage::Reporting), StageStatus::Skipped);
        assert_eq!(llm.calls(), 0);
        assert_eq!(store.pending_analysis().await.unwrap().len(), 3);

        // A later analyze-only run picks them up.
        let run = p.run_pipeline(RunMode::AnalyzeOnly).await;
        assert_eq!(run.analyzed_count, 3);
        assert_eq!(run.stage(Stage::Collecting), StageStatus::Skipped);
        assert!(store.pending_analysis().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_only_uses_latest_analyzed_run() {
        let store = Arc::new(JournalStore::in_memory());
        let sink = Arc::new(MemorySink::default());
        let p = pipeline(
            store.clone(),
            vec![three_repos()],
            Arc::new(FakeLlm::replying(GOOD_REPLY)),
            sink.clone(),
            CancellationToken::new(),
        );

        let full = p.run_pipeline(RunMode::Full).await;
        let report = p.run_pipeline(RunMode::ReportOnly).await;

        assert_eq!(report.status, RunStatus::Ok);
        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].0, full.run_id);
        assert_eq!(emitted[1].1.len(), 4);
    }

    #[tokio::test]
    async fn test_analysis_timeout_keeps_collected_data() {
        let store = Arc::new(JournalStore::in_memory());
        let llm = Arc::new(FakeLlm::replying(GOOD_REPLY).with_delay(Duration::from_secs(5)));
        let collector = Collector::new(store.clone(), vec![three_repos()], CollectorConfig::default());
        let analyzer = Analyzer::new(store.clone(), llm, AnalyzerConfig::default());
        let p = Pipeline::new(
            store.clone(),
            collector,
            analyzer,
            Arc::new(MemorySink::default()),
            PipelineSettings {
                analyze_timeout: Duration::from_millis(50),
                ..PipelineSettings::default()
            },
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::Full).await;

        assert_eq!(run.stage(Stage::Collecting), StageStatus::Ok);
        assert_eq!(run.stage(Stage::Analyzing), StageStatus::Partial);
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.collected_count, 3);
        assert_eq!(store.pending_analysis().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sink_failure_makes_reporting_partial() {
        let store = Arc::new(JournalStore::in_memory());
        let p = pipeline(
            store,
            vec![three_repos()],
            Arc::new(FakeLlm::replying(GOOD_REPLY)),
            Arc::new(MemorySink::failing()),
            CancellationToken::new(),
        );

        let run = p.run_pipeline(RunMode::Full).await;
        assert_eq!(run.stage(Stage::Reporting), StageStatus::Partial);
        assert_eq!(run.status, RunStatus::Partial);
    }

    fn entity(id: &str) -> Entity {
        let now = Utc::now();
        let obs = repo_item(id, "x").into_observation(now);
        Entity {
            source: obs.source,
            external_id: obs.external_id,
            kind: obs.kind,
            title: obs.title,
            url: obs.url,
            fingerprint: obs.fingerprint,
            first_seen_at: now,
            last_seen_at: now,
            last_analyzed_at: None,
            analyzed_fingerprint: None,
        }
    }

    #[test]
    fn test_merge_pending_dedups() {
        let merged = merge_pending(
            vec![entity("a/one")],
            vec![entity("a/one"), entity("a/two")],
        );
        let ids: Vec<&str> = merged.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a/one", "a/two"]);
    }
}
