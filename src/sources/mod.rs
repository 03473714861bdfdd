//! Source adapters.
//!
//! Each adapter talks to one external provider and normalizes its responses
//! into [`RawItem`]s. Adapters keep no state between calls: everything needed
//! to resume is carried in the `since` watermark and the opaque page cursor.

pub mod arxiv;
pub mod github;
pub mod http;
pub mod huggingface;
pub mod vendor;

use crate::config::SourcesConfig;
use crate::error::SourceError;
use crate::fingerprint::fingerprint;
use crate::models::{EntityKind, Observation, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use arxiv::ArxivAdapter;
pub use github::GithubAdapter;
pub use huggingface::HuggingFaceAdapter;
pub use vendor::VendorAdapter;

/// Canonical shape of one item fetched from any provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub source: SourceKind,
    pub external_id: String,
    pub kind: EntityKind,
    pub title: String,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Observable fields; a change here is a change of the entity.
    pub content: Value,
    /// Volatile counters (stars, downloads). Stored, not fingerprinted.
    pub metrics: Value,
}

impl RawItem {
    pub fn fingerprint(&self) -> String {
        fingerprint(&json!({
            "title": self.title,
            "content": self.content,
        }))
    }

    /// Turn the item into an observation stamped with `observed_at`.
    pub fn into_observation(self, observed_at: DateTime<Utc>) -> Observation {
        let fingerprint = self.fingerprint();
        let snapshot = json!({
            "title": self.title,
            "url": self.url,
            "published_at": self.published_at,
            "content": self.content,
            "metrics": self.metrics,
        });

        Observation {
            source: self.source,
            external_id: self.external_id,
            kind: self.kind,
            title: self.title,
            url: self.url,
            fingerprint,
            snapshot,
            observed_at,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<RawItem>,
    /// `None` once the source has been fully iterated.
    pub next_cursor: Option<String>,
}

/// A provider of raw items.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch one page of items changed since `since`, resuming at `cursor`.
    ///
    /// Calls with the same arguments are idempotent.
    async fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, SourceError>;
}

/// Build the HTTP client shared by all adapters.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("ai-insight/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Instantiate every enabled adapter.
pub fn build_adapters(
    config: &SourcesConfig,
    client: &reqwest::Client,
) -> Vec<Arc<dyn SourceAdapter>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    if config.github.enabled && !config.github.repos.is_empty() {
        adapters.push(Arc::new(GithubAdapter::new(client.clone(), &config.github)));
    }
    if config.huggingface.enabled && !config.huggingface.tags.is_empty() {
        adapters.push(Arc::new(HuggingFaceAdapter::new(
            client.clone(),
            &config.huggingface,
        )));
    }
    if config.arxiv.enabled && !config.arxiv.categories.is_empty() {
        adapters.push(Arc::new(ArxivAdapter::new(client.clone(), &config.arxiv)));
    }
    if config.vendor.enabled && !config.vendor.providers.is_empty() {
        adapters.push(Arc::new(VendorAdapter::new(client.clone(), &config.vendor)));
    }

    info!(
        "Enabled sources: {}",
        adapters
            .iter()
            .map(|a| a.kind().as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    adapters
}

/// Parse a cursor of the form `N` or `N:rest` into the index and the rest.
pub(crate) fn split_cursor(
    provider: SourceKind,
    cursor: Option<&str>,
) -> Result<(usize, Option<String>), SourceError> {
    let Some(cursor) = cursor else {
        return Ok((0, None));
    };

    let (index, rest) = match cursor.split_once(':') {
        Some((index, rest)) => (index, Some(rest.to_string())),
        None => (cursor, None),
    };
    let index = index
        .parse::<usize>()
        .map_err(|_| SourceError::unavailable(provider, format!("invalid cursor '{}'", cursor)))?;
    Ok((index, rest))
}
