//! In-process fakes shared by the unit tests.

use crate::error::{LlmError, ReportError, SourceError, StoreError};
use crate::llm::LlmClient;
use crate::models::{
    AnalysisResult, Entity, EntityKind, EntityRef, HistoryRecord, Observation, RunId, RunRecord,
    SourceKind,
};
use crate::report::{ReportPayload, ReportSink};
use crate::retry::RetryPolicy;
use crate::sources::{Page, RawItem, SourceAdapter};
use crate::store::{MemoryStore, SavedCursor, Upserted};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Retry policy without delays.
pub fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        multiplier: 2.0,
        jitter: false,
    }
}

pub fn raw_item(source: SourceKind, id: &str, description: &str) -> RawItem {
    let kind = match source {
        SourceKind::Github => EntityKind::Repository,
        SourceKind::Arxiv => EntityKind::Paper,
        SourceKind::Huggingface | SourceKind::Vendor => EntityKind::Model,
    };
    RawItem {
        source,
        external_id: id.to_string(),
        kind,
        title: id.to_string(),
        url: None,
        published_at: None,
        content: json!({ "description": description }),
        metrics: json!({ "stars": 1 }),
    }
}

pub fn repo_item(id: &str, description: &str) -> RawItem {
    raw_item(SourceKind::Github, id, description)
}

enum Behavior {
    /// Every fetch returns all items on one final page.
    Items(Vec<RawItem>),
    /// Responses are replayed in order, then empty final pages.
    Scripted(Mutex<VecDeque<Result<Page, SourceError>>>),
    Unavailable,
}

/// Scripted source adapter that records how it was called.
pub struct FakeSource {
    kind: SourceKind,
    behavior: Behavior,
    calls: AtomicU32,
    cursors: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

impl FakeSource {
    fn with(kind: SourceKind, behavior: Behavior) -> Self {
        Self {
            kind,
            behavior,
            calls: AtomicU32::new(0),
            cursors: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn items(kind: SourceKind, items: Vec<RawItem>) -> Self {
        Self::with(kind, Behavior::Items(items))
    }

    pub fn scripted(kind: SourceKind, responses: Vec<Result<Page, SourceError>>) -> Self {
        Self::with(kind, Behavior::Scripted(Mutex::new(responses.into())))
    }

    pub fn unavailable(kind: SourceKind) -> Self {
        Self::with(kind, Behavior::Unavailable)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(
        &self,
        _since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(cursor.map(String::from));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            Behavior::Items(items) => Ok(Page {
                items: items.clone(),
                next_cursor: None,
            }),
            Behavior::Scripted(responses) => responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::default())),
            Behavior::Unavailable => Err(SourceError::unavailable(self.kind, "HTTP 503")),
        }
    }
}

type Responder = Box<dyn Fn(u32, &str) -> Result<String, LlmError> + Send + Sync>;

/// LLM whose replies come from a closure over (1-based call number, prompt).
pub struct FakeLlm {
    respond: Responder,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl FakeLlm {
    pub fn new(
        respond: impl Fn(u32, &str) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn replying(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_, _| Ok(reply.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(call, prompt)
    }
}

/// A store whose backing storage is gone.
pub struct UnavailableStore;

fn gone<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable("storage offline".to_string()))
}

#[async_trait]
impl MemoryStore for UnavailableStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        gone()
    }
    async fn get_entity(&self, _: &EntityRef) -> Result<Option<Entity>, StoreError> {
        gone()
    }
    async fn upsert_entity(&self, _: Observation) -> Result<Upserted, StoreError> {
        gone()
    }
    async fn get_history(&self, _: &EntityRef, _: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        gone()
    }
    async fn put_analysis_result(&self, _: AnalysisResult) -> Result<(), StoreError> {
        gone()
    }
    async fn get_latest_analysis(&self, _: &EntityRef) -> Result<Option<AnalysisResult>, StoreError> {
        gone()
    }
    async fn analysis_for_run(&self, _: RunId) -> Result<Vec<AnalysisResult>, StoreError> {
        gone()
    }
    async fn pending_analysis(&self) -> Result<Vec<Entity>, StoreError> {
        gone()
    }
    async fn get_watermark(&self, _: SourceKind) -> Result<Option<DateTime<Utc>>, StoreError> {
        gone()
    }
    async fn set_watermark(&self, _: SourceKind, _: DateTime<Utc>) -> Result<(), StoreError> {
        gone()
    }
    async fn get_cursor(&self, _: SourceKind) -> Result<Option<SavedCursor>, StoreError> {
        gone()
    }
    async fn set_cursor(&self, _: SourceKind, _: Option<SavedCursor>) -> Result<(), StoreError> {
        gone()
    }
    async fn save_run(&self, _: &RunRecord) -> Result<(), StoreError> {
        gone()
    }
    async fn recent_runs(&self, _: usize) -> Result<Vec<RunRecord>, StoreError> {
        gone()
    }
    async fn last_successful_run(&self) -> Result<Option<RunRecord>, StoreError> {
        gone()
    }
}

/// Sink that keeps payloads in memory.
#[derive(Default)]
pub struct MemorySink {
    emitted: Mutex<Vec<(RunId, Vec<ReportPayload>)>>,
    fail: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn emitted(&self) -> Vec<(RunId, Vec<ReportPayload>)> {
        self.emitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn emit(&self, run_id: RunId, payloads: &[ReportPayload]) -> Result<usize, ReportError> {
        if self.fail {
            return Err(ReportError::Io {
                path: "memory".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "sink closed"),
            });
        }
        self.emitted
            .lock()
            .unwrap()
            .push((run_id, payloads.to_vec()));
        Ok(payloads.len())
    }
}
