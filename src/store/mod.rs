//! Memory store: entities, their append-only history, analysis results,
//! per-source watermarks and run records.
//!
//! The store is modelled as an append-only journal plus derived tables.
//! Every mutation is one journal operation, so an entity and its history
//! record (or an analysis result and the entity it marks analyzed) become
//! visible together or not at all.

pub mod journal;

use crate::error::StoreError;
use crate::models::{
    AnalysisResult, Entity, EntityRef, HistoryRecord, Observation, RunId, RunRecord, RunStatus,
    SourceKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use journal::JournalStore;

/// How an upsert classified the observed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    New,
    Changed,
    Unchanged,
}

/// Result of [`MemoryStore::upsert_entity`].
#[derive(Debug, Clone)]
pub struct Upserted {
    pub entity: Entity,
    pub change: Change,
}

/// Resume point of a source whose pass was cut short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCursor {
    pub cursor: String,
    /// When the interrupted pass began. The watermark advances to this
    /// time, not the resuming run's start, once the pass completes.
    pub pass_started_at: DateTime<Utc>,
}

/// Durable state shared across runs.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Verify the backing storage is reachable and writable.
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>, StoreError>;

    /// Insert or update an entity. A history record is appended when the
    /// entity is new or its fingerprint changed; an identical fingerprint
    /// only refreshes `last_seen_at`.
    async fn upsert_entity(&self, observation: Observation) -> Result<Upserted, StoreError>;

    /// Up to `limit` history records, most recent first.
    async fn get_history(
        &self,
        entity: &EntityRef,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Persist an analysis result. A successful result also marks the
    /// entity as analyzed for the fingerprint it covered.
    async fn put_analysis_result(&self, result: AnalysisResult) -> Result<(), StoreError>;

    async fn get_latest_analysis(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<AnalysisResult>, StoreError>;

    async fn analysis_for_run(&self, run_id: RunId) -> Result<Vec<AnalysisResult>, StoreError>;

    /// Entities whose current state has not been analyzed successfully.
    async fn pending_analysis(&self) -> Result<Vec<Entity>, StoreError>;

    async fn get_watermark(&self, source: SourceKind)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_watermark(&self, source: SourceKind, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn get_cursor(&self, source: SourceKind) -> Result<Option<SavedCursor>, StoreError>;

    async fn set_cursor(
        &self,
        source: SourceKind,
        cursor: Option<SavedCursor>,
    ) -> Result<(), StoreError>;

    async fn save_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Up to `limit` runs, most recent first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;

    async fn last_successful_run(&self) -> Result<Option<RunRecord>, StoreError>;
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalOp {
    Entity {
        entity: Entity,
        #[serde(skip_serializing_if = "Option::is_none")]
        history: Option<HistoryRecord>,
    },
    Analysis {
        result: AnalysisResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        entity: Option<Entity>,
    },
    Watermark {
        source: SourceKind,
        at: DateTime<Utc>,
    },
    Cursor {
        source: SourceKind,
        cursor: Option<SavedCursor>,
    },
    Run {
        record: RunRecord,
    },
}

/// In-memory tables derived from the journal.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    entities: HashMap<EntityRef, Entity>,
    /// Per entity, ascending by `observed_at`.
    history: HashMap<EntityRef, Vec<HistoryRecord>>,
    /// Per entity, ascending by run id.
    analyses: HashMap<EntityRef, Vec<AnalysisResult>>,
    watermarks: HashMap<SourceKind, DateTime<Utc>>,
    cursors: HashMap<SourceKind, SavedCursor>,
    runs: Vec<RunRecord>,
}

impl Tables {
    /// Work out the journal operation for an upsert without applying it.
    pub(crate) fn plan_upsert(&self, obs: Observation) -> (JournalOp, Upserted) {
        let key = obs.entity_ref();
        let history = HistoryRecord {
            entity: key.clone(),
            observed_at: obs.observed_at,
            fingerprint: obs.fingerprint.clone(),
            snapshot: obs.snapshot,
        };

        let (entity, change) = match self.entities.get(&key) {
            None => (
                Entity {
                    source: obs.source,
                    external_id: obs.external_id,
                    kind: obs.kind,
                    title: obs.title,
                    url: obs.url,
                    fingerprint: obs.fingerprint,
                    first_seen_at: obs.observed_at,
                    last_seen_at: obs.observed_at,
                    last_analyzed_at: None,
                    analyzed_fingerprint: None,
                },
                Change::New,
            ),
            Some(existing) if existing.fingerprint == obs.fingerprint => {
                let mut entity = existing.clone();
                entity.last_seen_at = entity.last_seen_at.max(obs.observed_at);
                (entity, Change::Unchanged)
            }
            Some(existing) => {
                let mut entity = existing.clone();
                entity.kind = obs.kind;
                entity.title = obs.title;
                entity.url = obs.url;
                entity.fingerprint = obs.fingerprint;
                entity.last_seen_at = entity.last_seen_at.max(obs.observed_at);
                (entity, Change::Changed)
            }
        };

        let history = match change {
            Change::Unchanged => None,
            Change::New | Change::Changed => Some(history),
        };

        (
            JournalOp::Entity {
                entity: entity.clone(),
                history,
            },
            Upserted { entity, change },
        )
    }

    /// Work out the journal operation for storing an analysis result.
    pub(crate) fn plan_analysis(&self, result: AnalysisResult) -> JournalOp {
        let entity = if result.is_success() {
            self.entities.get(&result.entity).map(|existing| {
                let mut entity = existing.clone();
                entity.last_analyzed_at = Some(result.analyzed_at);
                entity.analyzed_fingerprint = Some(result.fingerprint.clone());
                entity
            })
        } else {
            None
        };
        JournalOp::Analysis { result, entity }
    }

    pub(crate) fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Entity { entity, history } => {
                let key = entity.entity_ref();
                if let Some(record) = history {
                    let records = self.history.entry(key.clone()).or_default();
                    let at = records.partition_point(|r| r.observed_at <= record.observed_at);
                    records.insert(at, record);
                }
                self.entities.insert(key, entity);
            }
            JournalOp::Analysis { result, entity } => {
                if let Some(entity) = entity {
                    self.entities.insert(entity.entity_ref(), entity);
                }
                let results = self.analyses.entry(result.entity.clone()).or_default();
                match results.iter().position(|r| r.run_id == result.run_id) {
                    Some(i) => results[i] = result,
                    None => {
                        let at = results.partition_point(|r| r.run_id < result.run_id);
                        results.insert(at, result);
                    }
                }
            }
            JournalOp::Watermark { source, at } => {
                self.watermarks.insert(source, at);
            }
            JournalOp::Cursor { source, cursor } => match cursor {
                Some(cursor) => {
                    self.cursors.insert(source, cursor);
                }
                None => {
                    self.cursors.remove(&source);
                }
            },
            JournalOp::Run { record } => {
                match self.runs.iter().position(|r| r.run_id == record.run_id) {
                    Some(i) => self.runs[i] = record,
                    None => {
                        let at = self.runs.partition_point(|r| r.run_id < record.run_id);
                        self.runs.insert(at, record);
                    }
                }
            }
        }
    }

    /// The smallest journal that rebuilds these tables: one line per
    /// history record, analysis result, watermark, cursor and run.
    pub(crate) fn snapshot(&self) -> Vec<JournalOp> {
        let mut ops = Vec::new();

        let mut keys: Vec<&EntityRef> = self.entities.keys().collect();
        keys.sort();
        for key in keys {
            let entity = &self.entities[key];
            match self.history.get(key).filter(|records| !records.is_empty()) {
                Some(records) => ops.extend(records.iter().map(|record| JournalOp::Entity {
                    entity: entity.clone(),
                    history: Some(record.clone()),
                })),
                None => ops.push(JournalOp::Entity {
                    entity: entity.clone(),
                    history: None,
                }),
            }
            if let Some(results) = self.analyses.get(key) {
                ops.extend(results.iter().map(|result| JournalOp::Analysis {
                    result: result.clone(),
                    entity: None,
                }));
            }
        }

        let mut watermarks: Vec<_> = self.watermarks.iter().collect();
        watermarks.sort_by_key(|(source, _)| **source);
        ops.extend(watermarks.into_iter().map(|(source, at)| JournalOp::Watermark {
            source: *source,
            at: *at,
        }));

        let mut cursors: Vec<_> = self.cursors.iter().collect();
        cursors.sort_by_key(|(source, _)| **source);
        ops.extend(cursors.into_iter().map(|(source, saved)| JournalOp::Cursor {
            source: *source,
            cursor: Some(saved.clone()),
        }));

        ops.extend(self.runs.iter().map(|record| JournalOp::Run {
            record: record.clone(),
        }));
        ops
    }

    pub(crate) fn entity(&self, key: &EntityRef) -> Option<Entity> {
        self.entities.get(key).cloned()
    }

    pub(crate) fn history(&self, key: &EntityRef, limit: usize) -> Vec<HistoryRecord> {
        self.history
            .get(key)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn latest_analysis(&self, key: &EntityRef) -> Option<AnalysisResult> {
        self.analyses.get(key).and_then(|r| r.last()).cloned()
    }

    pub(crate) fn analysis_for_run(&self, run_id: RunId) -> Vec<AnalysisResult> {
        let mut results: Vec<AnalysisResult> = self
            .analyses
            .values()
            .flat_map(|r| r.iter().filter(|a| a.run_id == run_id))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.entity.cmp(&b.entity));
        results
    }

    pub(crate) fn pending_analysis(&self) -> Vec<Entity> {
        let mut pending: Vec<Entity> = self
            .entities
            .values()
            .filter(|e| e.needs_analysis())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.entity_ref().cmp(&b.entity_ref()));
        pending
    }

    pub(crate) fn watermark(&self, source: SourceKind) -> Option<DateTime<Utc>> {
        self.watermarks.get(&source).copied()
    }

    pub(crate) fn cursor(&self, source: SourceKind) -> Option<SavedCursor> {
        self.cursors.get(&source).cloned()
    }

    pub(crate) fn recent_runs(&self, limit: usize) -> Vec<RunRecord> {
        self.runs.iter().rev().take(limit).cloned().collect()
    }

    pub(crate) fn last_successful_run(&self) -> Option<RunRecord> {
        self.runs
            .iter()
            .rev()
            .find(|r| r.status == RunStatus::Ok)
            .cloned()
    }
}
