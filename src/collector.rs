//! Collector: drives the source adapters and diffs against the memory store.
//!
//! Sources run concurrently on a bounded pool. Within one source, pages are
//! fetched and upserted in order. Source failures are isolated and recorded
//! in the batch; only store errors escape.

use crate::error::{SourceError, StoreError};
use crate::models::{Entity, EntityRef, SourceKind, SourceReport, SourceStatus, StageStatus};
use crate::retry::{RetryAction, RetryPolicy};
use crate::sources::SourceAdapter;
use crate::store::{Change, MemoryStore, SavedCursor};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collector tuning.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Maximum number of sources fetched at once.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    /// Longer rate-limit hints defer the source instead of waiting.
    pub max_rate_limit_wait: Duration,
    /// Pages per source per run; the rest is resumed next run.
    pub max_pages: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_rate_limit_wait: Duration::from_secs(120),
            max_pages: 100,
        }
    }
}

/// New and changed entities from one collection pass, plus per-source
/// outcomes.
#[derive(Debug, Default)]
pub struct CollectBatch {
    pub entities: Vec<Entity>,
    pub sources: BTreeMap<SourceKind, SourceReport>,
}

impl CollectBatch {
    fn absorb(&mut self, outcome: SourceOutcome) {
        for entity in outcome.entities {
            let key = entity.entity_ref();
            match self.entities.iter().position(|e| e.entity_ref() == key) {
                Some(i) => self.entities[i] = entity,
                None => self.entities.push(entity),
            }
        }
        self.sources.insert(outcome.kind, outcome.report);
    }

    /// Refs of the collected entities.
    #[allow(dead_code)] // Used by tests
    pub fn refs(&self) -> Vec<EntityRef> {
        self.entities.iter().map(|e| e.entity_ref()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.sources.values().map(|r| r.errors).sum()
    }

    /// `partial` when any source failed. Deferred sources are not failures.
    pub fn stage_status(&self) -> StageStatus {
        if self
            .sources
            .values()
            .any(|r| r.status == SourceStatus::Failed)
        {
            StageStatus::Partial
        } else {
            StageStatus::Ok
        }
    }
}

struct SourceOutcome {
    kind: SourceKind,
    report: SourceReport,
    entities: Vec<Entity>,
}

/// Fetches from every adapter and records what changed.
pub struct Collector {
    store: Arc<dyn MemoryStore>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            config,
        }
    }

    /// Run every adapter, merging each finished source into `batch`.
    ///
    /// Results land in `batch` as sources complete, so a caller that stops
    /// waiting keeps whatever already finished.
    pub async fn collect(&self, batch: &mut CollectBatch) -> Result<(), StoreError> {
        if self.adapters.is_empty() {
            info!("No sources enabled");
            return Ok(());
        }

        let concurrency = self.config.concurrency.clamp(1, self.adapters.len());
        let mut outcomes = stream::iter(
            self.adapters
                .iter()
                .map(|adapter| self.collect_source(adapter.as_ref())),
        )
        .buffer_unordered(concurrency);

        while let Some(outcome) = outcomes.next().await {
            batch.absorb(outcome?);
        }

        info!(
            "Collected {} new or changed entities from {} sources",
            batch.entities.len(),
            batch.sources.len()
        );
        Ok(())
    }

    async fn collect_source(&self, adapter: &dyn SourceAdapter) -> Result<SourceOutcome, StoreError> {
        let kind = adapter.kind();
        let since = self.store.get_watermark(kind).await?;
        let saved = self.store.get_cursor(kind).await?;
        let mut report = SourceReport::default();
        let mut entities = Vec::new();

        // A resumed pass keeps the start time of the run that began it.
        let pass_started = match saved {
            Some(ref saved) => {
                info!(
                    "{}: resuming from saved cursor (pass started {})",
                    kind, saved.pass_started_at
                );
                saved.pass_started_at
            }
            None => Utc::now(),
        };
        let mut cursor = saved.map(|s| s.cursor);

        let fetch_timeout = self.config.fetch_timeout;
        let max_wait = self.config.max_rate_limit_wait;
        let classify = |e: &SourceError| match e {
            SourceError::Unavailable { .. } => RetryAction::Backoff,
            SourceError::RateLimited { retry_after, .. } if *retry_after <= max_wait => {
                RetryAction::After(*retry_after)
            }
            SourceError::RateLimited { .. } => RetryAction::Stop,
        };

        loop {
            if report.pages >= self.config.max_pages {
                info!("{}: page limit reached, deferring the rest", kind);
                self.defer(kind, cursor.as_deref(), pass_started).await?;
                report.status = SourceStatus::Deferred;
                break;
            }

            let page_cursor = cursor.as_deref();
            let attempted = self
                .config
                .retry
                .run(
                    move |_| async move {
                        match tokio::time::timeout(fetch_timeout, adapter.fetch(since, page_cursor))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(SourceError::unavailable(
                                kind,
                                format!("fetch timed out after {}s", fetch_timeout.as_secs()),
                            )),
                        }
                    },
                    classify,
                )
                .await;

            let page = match attempted.result {
                Ok(page) => {
                    report.errors += attempted.attempts as usize - 1;
                    page
                }
                Err(SourceError::RateLimited { retry_after, .. }) => {
                    warn!(
                        "{}: rate limited, deferring (retry after {}s)",
                        kind,
                        retry_after.as_secs()
                    );
                    self.defer(kind, cursor.as_deref(), pass_started).await?;
                    report.status = SourceStatus::Deferred;
                    report.retry_after_secs = Some(retry_after.as_secs());
                    report.last_error = Some(format!("rate limited for {}s", retry_after.as_secs()));
                    break;
                }
                Err(e) => {
                    warn!(
                        "{}: giving up after {} attempts: {}",
                        kind, attempted.attempts, e
                    );
                    report.status = SourceStatus::Failed;
                    report.errors += attempted.attempts as usize;
                    report.last_error = Some(e.to_string());
                    break;
                }
            };

            report.pages += 1;
            for item in page.items {
                let upserted = self.store.upsert_entity(item.into_observation(Utc::now())).await?;
                match upserted.change {
                    Change::New => report.new += 1,
                    Change::Changed => report.changed += 1,
                    Change::Unchanged => {
                        report.unchanged += 1;
                        continue;
                    }
                }
                entities.push(upserted.entity);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    self.store.set_watermark(kind, pass_started).await?;
                    self.store.set_cursor(kind, None).await?;
                    debug!("{}: watermark advanced to {}", kind, pass_started);
                    break;
                }
            }
        }

        info!(
            source = %kind,
            status = ?report.status,
            new = report.new,
            changed = report.changed,
            unchanged = report.unchanged,
            "Source collected"
        );

        Ok(SourceOutcome {
            kind,
            report,
            entities,
        })
    }

    /// Save where the pass stopped. Without a cursor nothing was fetched
    /// yet, so the next run simply starts a fresh pass.
    async fn defer(
        &self,
        kind: SourceKind,
        cursor: Option<&str>,
        pass_started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let saved = cursor.map(|cursor| SavedCursor {
            cursor: cursor.to_string(),
            pass_started_at,
        });
        self.store.set_cursor(kind, saved).await
    }
}
