//! Journal-backed memory store.
//!
//! All mutations are appended as JSON lines to `{dir}/journal.jsonl` before
//! the in-memory tables are updated. Opening a store replays the journal.
//! A torn last line (crash mid-append) is dropped and truncated away; any
//! other unreadable line is reported as corruption. When the replayed
//! journal holds superseded lines (unchanged re-observations, repeated run
//! saves) it is rewritten as a snapshot of the tables.

use super::{Change, JournalOp, MemoryStore, SavedCursor, Tables, Upserted};
use crate::error::StoreError;
use crate::models::{
    AnalysisResult, Entity, EntityRef, HistoryRecord, Observation, RunId, RunRecord, SourceKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "journal.jsonl";

/// Memory store persisted as an append-only JSON-lines journal.
pub struct JournalStore {
    /// `None` for a purely in-memory store.
    journal: Option<PathBuf>,
    /// Writers hold this lock across append + apply, which serializes all
    /// writes (and therefore all writes to the same key).
    tables: Mutex<Tables>,
}

impl JournalStore {
    /// Open (or create) a store in `dir`, replaying any existing journal.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            StoreError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(JOURNAL_FILE);
        let (tables, replayed) = replay(&path)?;

        let snapshot = tables.snapshot();
        if replayed > snapshot.len() {
            compact(&path, &snapshot)?;
            info!(
                "Compacted journal from {} to {} lines",
                replayed,
                snapshot.len()
            );
        }
        info!("Opened memory store at {}", path.display());

        Ok(Self {
            journal: Some(path),
            tables: Mutex::new(tables),
        })
    }

    /// A store that keeps everything in memory.
    #[allow(dead_code)] // Used by tests
    pub fn in_memory() -> Self {
        Self {
            journal: None,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Path of the journal file, if any.
    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref()
    }

    fn append(&self, op: &JournalOp) -> Result<(), StoreError> {
        if let Some(ref path) = self.journal {
            serde_jsonlines::append_json_lines(path, [op])?;
        }
        Ok(())
    }

    async fn commit(&self, op: JournalOp) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        self.append(&op)?;
        tables.apply(op);
        Ok(())
    }
}

/// Rebuild the tables from the journal at `path`. Also returns the number
/// of operations replayed.
fn replay(path: &Path) -> Result<(Tables, usize), StoreError> {
    let mut tables = Tables::default();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((tables, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut offset = 0usize;
    let mut applied = 0usize;
    for (idx, line) in content.split_inclusive('\n').enumerate() {
        let complete = line.ends_with('\n');
        let text = line.trim();

        if !text.is_empty() {
            match serde_json::from_str::<JournalOp>(text) {
                Ok(op) => {
                    tables.apply(op);
                    applied += 1;
                }
                Err(e) if !complete => {
                    warn!(
                        line = idx + 1,
                        "Dropping torn journal tail in {}: {}",
                        path.display(),
                        e
                    );
                    truncate(path, offset)?;
                    break;
                }
                Err(e) => {
                    return Err(StoreError::Corrupt {
                        line: idx + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }

        offset += line.len();
    }

    debug!("Replayed {} journal operations", applied);
    Ok((tables, applied))
}

/// Replace the journal with `snapshot`. The new file is written beside the
/// old one and renamed over it, so a crash leaves one of the two intact.
fn compact(path: &Path, snapshot: &[JournalOp]) -> Result<(), StoreError> {
    let tmp = path.with_extension("jsonl.tmp");
    serde_jsonlines::write_json_lines(&tmp, snapshot)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn truncate(path: &Path, len: usize) -> Result<(), StoreError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len as u64)?;
    Ok(())
}

#[async_trait]
impl MemoryStore for JournalStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        if let Some(ref path) = self.journal {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    StoreError::Unavailable(format!("journal {} not writable: {}", path.display(), e))
                })?;
        }
        Ok(())
    }

    async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>, StoreError> {
        Ok(self.tables.lock().await.entity(entity))
    }

    async fn upsert_entity(&self, observation: Observation) -> Result<Upserted, StoreError> {
        let mut tables = self.tables.lock().await;
        let (op, upserted) = tables.plan_upsert(observation);
        self.append(&op)?;
        tables.apply(op);

        if upserted.change != Change::Unchanged {
            debug!(
                entity = %upserted.entity.entity_ref(),
                change = ?upserted.change,
                "Upserted entity"
            );
        }
        Ok(upserted)
    }

    async fn get_history(
        &self,
        entity: &EntityRef,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self.tables.lock().await.history(entity, limit))
    }

    async fn put_analysis_result(&self, result: AnalysisResult) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let op = tables.plan_analysis(result);
        self.append(&op)?;
        tables.apply(op);
        Ok(())
    }

    async fn get_latest_analysis(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self.tables.lock().await.latest_analysis(entity))
    }

    async fn analysis_for_run(&self, run_id: RunId) -> Result<Vec<AnalysisResult>, StoreError> {
        Ok(self.tables.lock().await.analysis_for_run(run_id))
    }

    async fn pending_analysis(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self.tables.lock().await.pending_analysis())
    }

    async fn get_watermark(
        &self,
        source: SourceKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.tables.lock().await.watermark(source))
    }

    async fn set_watermark(&self, source: SourceKind, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.commit(JournalOp::Watermark { source, at }).await
    }

    async fn get_cursor(&self, source: SourceKind) -> Result<Option<SavedCursor>, StoreError> {
        Ok(self.tables.lock().await.cursor(source))
    }

    async fn set_cursor(
        &self,
        source: SourceKind,
        cursor: Option<SavedCursor>,
    ) -> Result<(), StoreError> {
        self.commit(JournalOp::Cursor { source, cursor }).await
    }

    async fn save_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.commit(JournalOp::Run {
            record: record.clone(),
        })
        .await
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self.tables.lock().await.recent_runs(limit))
    }

    async fn last_successful_run(&self) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.tables.lock().await.last_successful_run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisStatus, EntityKind, RunMode, RunStatus};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().unwrap()
    }

    fn observation(id: &str, description: &str, observed_at: DateTime<Utc>) -> Observation {
        let content = json!({ "description": description });
        Observation {
            source: SourceKind::Github,
            external_id: id.to_string(),
            kind: EntityKind::Repository,
            title: id.to_string(),
            url: Some(format!("https://github.com/{}", id)),
            fingerprint: crate::fingerprint::fingerprint(&content),
            snapshot: json!({ "content": content }),
            observed_at,
        }
    }

    fn analysis(entity: &Entity, run: u64, status: AnalysisStatus) -> AnalysisResult {
        AnalysisResult {
            entity: entity.entity_ref(),
            run_id: RunId(run),
            kind: entity.kind,
            title: entity.title.clone(),
            fingerprint: entity.fingerprint.clone(),
            summary: "summary".to_string(),
            derived_metrics: BTreeMap::new(),
            status,
            error: None,
            attempts: 1,
            analyzed_at: at(100),
        }
    }

    #[tokio::test]
    async fn test_identical_upsert_appends_history_once() {
        let store = JournalStore::in_memory();
        let first = store
            .upsert_entity(observation("a/b", "same", at(0)))
            .await
            .unwrap();
        let second = store
            .upsert_entity(observation("a/b", "same", at(10)))
            .await
            .unwrap();

        assert_eq!(first.change, Change::New);
        assert_eq!(second.change, Change::Unchanged);
        assert_eq!(second.entity.last_seen_at, at(10));
        assert_eq!(second.entity.first_seen_at, at(0));

        let key = EntityRef::new(SourceKind::Github, "a/b");
        let history = store.get_history(&key, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_upsert_keeps_both_snapshots_most_recent_first() {
        let store = JournalStore::in_memory();
        store
            .upsert_entity(observation("a/b", "v1", at(0)))
            .await
            .unwrap();
        let changed = store
            .upsert_entity(observation("a/b", "v2", at(5)))
            .await
            .unwrap();
        assert_eq!(changed.change, Change::Changed);

        let key = EntityRef::new(SourceKind::Github, "a/b");
        let history = store.get_history(&key, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].observed_at, at(5));
        assert_eq!(history[0].snapshot["content"]["description"], "v2");
        assert_eq!(history[1].snapshot["content"]["description"], "v1");

        let limited = store.get_history(&key, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].observed_at, at(5));
    }

    #[tokio::test]
    async fn test_get_entity_not_found() {
        let store = JournalStore::in_memory();
        let key = EntityRef::new(SourceKind::Vendor, "openai/gpt-x");
        assert!(store.get_entity(&key).await.unwrap().is_none());
        assert!(store.get_latest_analysis(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_successful_analysis_clears_pending() {
        let store = JournalStore::in_memory();
        let up = store
            .upsert_entity(observation("a/b", "v1", at(0)))
            .await
            .unwrap();
        assert_eq!(store.pending_analysis().await.unwrap().len(), 1);

        store
            .put_analysis_result(analysis(&up.entity, 1, AnalysisStatus::Failed))
            .await
            .unwrap();
        assert_eq!(store.pending_analysis().await.unwrap().len(), 1);

        store
            .put_analysis_result(analysis(&up.entity, 2, AnalysisStatus::Success))
            .await
            .unwrap();
        assert!(store.pending_analysis().await.unwrap().is_empty());

        let entity = store.get_entity(&up.entity.entity_ref()).await.unwrap().unwrap();
        assert_eq!(entity.last_analyzed_at, Some(at(100)));

        let latest = store
            .get_latest_analysis(&up.entity.entity_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.run_id, RunId(2));
        assert_eq!(store.analysis_for_run(RunId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermarks_and_cursors() {
        let store = JournalStore::in_memory();
        assert!(store.get_watermark(SourceKind::Arxiv).await.unwrap().is_none());

        store.set_watermark(SourceKind::Arxiv, at(42)).await.unwrap();
        let saved = SavedCursor {
            cursor: "3".to_string(),
            pass_started_at: at(40),
        };
        store
            .set_cursor(SourceKind::Arxiv, Some(saved.clone()))
            .await
            .unwrap();
        assert_eq!(store.get_watermark(SourceKind::Arxiv).await.unwrap(), Some(at(42)));
        assert_eq!(store.get_cursor(SourceKind::Arxiv).await.unwrap(), Some(saved));

        store.set_cursor(SourceKind::Arxiv, None).await.unwrap();
        assert!(store.get_cursor(SourceKind::Arxiv).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_are_ordered_and_updated_in_place() {
        let store = JournalStore::in_memory();
        let mut first = RunRecord::new(RunId(1), RunMode::Full, at(0));
        store.save_run(&first).await.unwrap();
        let second = RunRecord::new(RunId(2), RunMode::Full, at(10));
        store.save_run(&second).await.unwrap();

        first.finalize(at(5));
        store.save_run(&first).await.unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, RunId(2));
        assert_eq!(runs[1].status, RunStatus::Ok);

        let last_ok = store.last_successful_run().await.unwrap().unwrap();
        assert_eq!(last_ok.run_id, RunId(1));
    }

    #[tokio::test]
    async fn test_journal_replay_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .upsert_entity(observation("a/b", "v1", at(0)))
                .await
                .unwrap();
            store
                .upsert_entity(observation("a/b", "v2", at(1)))
                .await
                .unwrap();
            store.set_watermark(SourceKind::Github, at(2)).await.unwrap();
        }

        let store = JournalStore::open(dir.path()).unwrap();
        let key = EntityRef::new(SourceKind::Github, "a/b");
        let entity = store.get_entity(&key).await.unwrap().unwrap();
        assert_eq!(entity.first_seen_at, at(0));
        assert_eq!(store.get_history(&key, 10).await.unwrap().len(), 2);
        assert_eq!(store.get_watermark(SourceKind::Github).await.unwrap(), Some(at(2)));

        let again = store
            .upsert_entity(observation("a/b", "v2", at(3)))
            .await
            .unwrap();
        assert_eq!(again.change, Change::Unchanged);
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .upsert_entity(observation("a/b", "v1", at(0)))
                .await
                .unwrap();
        }

        let path = dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"op":"entity","entity":{"sou"#).unwrap();
        drop(file);

        let store = JournalStore::open(dir.path()).unwrap();
        let key = EntityRef::new(SourceKind::Github, "a/b");
        assert!(store.get_entity(&key).await.unwrap().is_some());

        // The next append must land on a clean line.
        store
            .upsert_entity(observation("c/d", "v1", at(1)))
            .await
            .unwrap();
        drop(store);
        let store = JournalStore::open(dir.path()).unwrap();
        let other = EntityRef::new(SourceKind::Github, "c/d");
        assert!(store.get_entity(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_superseded_lines_are_compacted_on_open() {
        let dir = TempDir::new().unwrap();
        let mut run = RunRecord::new(RunId(1), RunMode::Full, at(0));
        {
            let store = JournalStore::open(dir.path()).unwrap();
            for secs in 0..10 {
                store
                    .upsert_entity(observation("a/b", "same", at(secs)))
                    .await
                    .unwrap();
            }
            store.save_run(&run).await.unwrap();
            run.finalize(at(20));
            store.save_run(&run).await.unwrap();
        }

        let path = dir.path().join(JOURNAL_FILE);
        let line_count = || std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(line_count(), 12);

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(line_count(), 2);

        let key = EntityRef::new(SourceKind::Github, "a/b");
        let entity = store.get_entity(&key).await.unwrap().unwrap();
        assert_eq!(entity.first_seen_at, at(0));
        assert_eq!(entity.last_seen_at, at(9));
        assert_eq!(store.get_history(&key, 10).await.unwrap().len(), 1);
        assert_eq!(store.recent_runs(5).await.unwrap(), vec![run.clone()]);
        drop(store);

        // A compacted journal is already minimal.
        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(line_count(), 2);
        assert_eq!(store.recent_runs(5).await.unwrap(), vec![run]);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        std::fs::write(&path, "not json\n{\"op\":\"cursor\",\"source\":\"github\",\"cursor\":null}\n")
            .unwrap();

        let err = JournalStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_history_orders_out_of_order_observations() {
        let store = JournalStore::in_memory();
        store
            .upsert_entity(observation("a/b", "v1", at(10)))
            .await
            .unwrap();
        store
            .upsert_entity(observation("a/b", "v2", at(10) - Duration::seconds(5)))
            .await
            .unwrap();

        let key = EntityRef::new(SourceKind::Github, "a/b");
        let history = store.get_history(&key, 10).await.unwrap();
        assert_eq!(history[0].observed_at, at(10));
        assert_eq!(history[1].observed_at, at(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_on_one_key_serialize() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(JournalStore::open(dir.path()).unwrap());

        // Same observation time everywhere, so history order is commit order.
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .upsert_entity(observation("a/b", &format!("v{}", i % 5), at(5)))
                        .await
                        .unwrap()
                        .change
                })
            })
            .collect();

        let mut changes = 0;
        for handle in handles {
            if handle.await.unwrap() != Change::Unchanged {
                changes += 1;
            }
        }

        let key = EntityRef::new(SourceKind::Github, "a/b");
        let entity = store.get_entity(&key).await.unwrap().unwrap();
        let history = store.get_history(&key, 100).await.unwrap();
        assert_eq!(history.len(), changes);
        assert_eq!(entity.fingerprint, history[0].fingerprint);

        let reopened = JournalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_history(&key, 100).await.unwrap().len(), changes);
        assert_eq!(
            reopened.get_entity(&key).await.unwrap().unwrap().fingerprint,
            entity.fingerprint
        );
    }

    #[tokio::test]
    async fn test_health_check_on_directory() {
        let dir = TempDir::new().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        assert_ok!(store.health_check().await);
        assert_ok!(JournalStore::in_memory().health_check().await);
    }
}
