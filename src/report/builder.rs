//! Aggregation of a run's analysis results into report payloads.
//!
//! Everything here is a pure function of its inputs: the same run record
//! and the same set of results produce the same payloads in any order.

use super::{
    FailureEntry, FailureSection, Highlight, ModelReport, ReportPayload, RunSummary, Totals,
    TrendReport,
};
use crate::models::{AnalysisResult, AnalysisStatus, EntityKind, MetricValue, RunRecord, SourceKind};
use std::collections::BTreeMap;

/// Build the trend report followed by one detail report per successful
/// model-adjacent result.
pub fn build_reports(run: &RunRecord, results: &[AnalysisResult]) -> Vec<ReportPayload> {
    let mut sorted: Vec<&AnalysisResult> = results.iter().collect();
    sorted.sort_by(|a, b| a.entity.cmp(&b.entity).then(a.run_id.cmp(&b.run_id)));

    let successes: Vec<&AnalysisResult> =
        sorted.iter().copied().filter(|r| r.is_success()).collect();

    let trend = TrendReport {
        run: RunSummary::from(run),
        totals: totals(&sorted),
        by_source: count_by_source(&successes),
        by_kind: count_by_kind(&successes),
        highlights: successes
            .iter()
            .map(|r| Highlight {
                entity: r.entity.clone(),
                kind: r.kind,
                title: r.title.clone(),
                summary: r.summary.clone(),
            })
            .collect(),
        metric_averages: metric_averages(&successes),
        failures: failures(&sorted),
    };

    let mut payloads = vec![ReportPayload::Trend(trend)];
    payloads.extend(
        successes
            .iter()
            .filter(|r| r.kind.is_model_adjacent())
            .map(|r| {
                ReportPayload::ModelDetail(ModelReport {
                    run_id: r.run_id,
                    entity: r.entity.clone(),
                    kind: r.kind,
                    title: r.title.clone(),
                    summary: r.summary.clone(),
                    metrics: r.derived_metrics.clone(),
                    analyzed_at: r.analyzed_at,
                    attempts: r.attempts,
                })
            }),
    );
    payloads
}

fn totals(results: &[&AnalysisResult]) -> Totals {
    let mut totals = Totals {
        results: results.len(),
        ..Totals::default()
    };
    for result in results {
        match result.status {
            AnalysisStatus::Success => totals.succeeded += 1,
            AnalysisStatus::Failed => totals.failed += 1,
            AnalysisStatus::Skipped => totals.skipped += 1,
        }
    }
    totals
}

/// Count results per source.
fn count_by_source(results: &[&AnalysisResult]) -> BTreeMap<SourceKind, usize> {
    let mut counts = BTreeMap::new();
    for result in results {
        *counts.entry(result.entity.source).or_default() += 1;
    }
    counts
}

/// Count results per entity kind.
fn count_by_kind(results: &[&AnalysisResult]) -> BTreeMap<EntityKind, usize> {
    let mut counts = BTreeMap::new();
    for result in results {
        *counts.entry(result.kind).or_default() += 1;
    }
    counts
}

/// Average every numeric metric over the results that report it.
fn metric_averages(results: &[&AnalysisResult]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for result in results {
        for (name, value) in &result.derived_metrics {
            if let MetricValue::Number(n) = value {
                let entry = sums.entry(name.clone()).or_insert((0.0, 0));
                entry.0 += n;
                entry.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect()
}

/// Everything that did not succeed.
fn failures(results: &[&AnalysisResult]) -> FailureSection {
    let items: Vec<FailureEntry> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| FailureEntry {
            entity: r.entity.clone(),
            title: r.title.clone(),
            error: r.error.clone(),
        })
        .collect();
    FailureSection {
        count: items.len(),
        items,
    }
}
