//! Per-entity analysis: history context, LLM call, persisted result.

use super::prompt::{build_prompt, SYSTEM_PROMPT};
use super::response::parse_response;
use crate::error::{LlmError, StoreError};
use crate::llm::LlmClient;
use crate::models::{AnalysisResult, AnalysisStatus, Entity, RunId};
use crate::retry::{RetryAction, RetryPolicy};
use crate::store::MemoryStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Analyzer tuning.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Maximum number of entities analyzed at once.
    pub concurrency: usize,
    /// History records loaded as context.
    pub history_depth: usize,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            history_depth: 5,
            call_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Running counts for one analysis pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnalyzeTally {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Analyzer {
    store: Arc<dyn MemoryStore>,
    llm: Arc<dyn LlmClient>,
    config: AnalyzerConfig,
}

/// Client errors other than throttling will not improve on retry.
fn retry_action(e: &LlmError) -> RetryAction {
    match e {
        LlmError::Api { status, .. } if (400..500).contains(status) && *status != 429 => {
            RetryAction::Stop
        }
        _ => RetryAction::Backoff,
    }
}

impl Analyzer {
    pub fn new(store: Arc<dyn MemoryStore>, llm: Arc<dyn LlmClient>, config: AnalyzerConfig) -> Self {
        Self { store, llm, config }
    }

    /// Analyze `entities`, persisting one result per entity under `run_id`.
    ///
    /// `tally` is updated as each entity finishes. Only store errors abort.
    pub async fn analyze(
        &self,
        run_id: RunId,
        entities: &[Entity],
        tally: &mut AnalyzeTally,
    ) -> Result<(), StoreError> {
        if entities.is_empty() {
            info!("Nothing to analyze");
            return Ok(());
        }

        info!(
            "Analyzing {} entities with {} (concurrency {})",
            entities.len(),
            self.llm.model(),
            self.config.concurrency
        );

        let mut results = stream::iter(entities.iter().map(|e| self.analyze_entity(run_id, e)))
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(result) = results.next().await {
            let result = result?;
            tally.processed += 1;
            if result.is_success() {
                tally.succeeded += 1;
            } else {
                tally.failed += 1;
            }
        }

        info!(
            "Analysis finished: {} succeeded, {} failed",
            tally.succeeded, tally.failed
        );
        Ok(())
    }

    async fn analyze_entity(
        &self,
        run_id: RunId,
        entity: &Entity,
    ) -> Result<AnalysisResult, StoreError> {
        let key = entity.entity_ref();
        let history = self
            .store
            .get_history(&key, self.config.history_depth)
            .await?;
        let prompt = build_prompt(entity, &history);

        let llm = self.llm.as_ref();
        let prompt_ref = prompt.as_str();
        let key_ref = &key;
        let call_timeout = self.config.call_timeout;
        let attempted = self
            .config
            .retry
            .run(
                move |attempt| async move {
                    debug!(entity = %key_ref, attempt, "Calling LLM");
                    let reply =
                        tokio::time::timeout(call_timeout, llm.complete(SYSTEM_PROMPT, prompt_ref))
                            .await
                            .map_err(|_| LlmError::Timeout(call_timeout.as_secs()))??;
                    parse_response(&reply)
                },
                retry_action,
            )
            .await;

        let (status, summary, derived_metrics, error) = match attempted.result {
            Ok(parsed) => (AnalysisStatus::Success, parsed.summary, parsed.metrics, None),
            Err(e) => {
                warn!(
                    "Analysis of {} failed after {} attempts: {}",
                    key, attempted.attempts, e
                );
                (AnalysisStatus::Failed, String::new(), BTreeMap::new(), Some(e.to_string()))
            }
        };

        let result = AnalysisResult {
            entity: key,
            run_id,
            kind: entity.kind,
            title: entity.title.clone(),
            fingerprint: entity.fingerprint.clone(),
            summary,
            derived_metrics,
            status,
            error,
            attempts: attempted.attempts,
            analyzed_at: Utc::now(),
        };
        self.store.put_analysis_result(result.clone()).await?;
        Ok(result)
    }
}
