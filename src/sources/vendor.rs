//! Vendor model-listing adapter.
//!
//! Reads OpenAI-compatible `GET /v1/models` listings from each configured
//! provider. The cursor is `{provider_index}` or
//! `{provider_index}:{after_id}` when the provider paginates.

use super::http::get_json;
use super::{split_cursor, Page, RawItem, SourceAdapter};
use crate::config::{VendorAuth, VendorConfig, VendorProvider};
use crate::error::SourceError;
use crate::models::{EntityKind, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const KIND: SourceKind = SourceKind::Vendor;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
    #[serde(default)]
    has_more: bool,
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    /// Unix seconds (OpenAI style).
    created: Option<i64>,
    /// RFC 3339 (Anthropic style).
    created_at: Option<String>,
    owned_by: Option<String>,
    display_name: Option<String>,
}

impl ModelEntry {
    fn created(&self) -> Option<DateTime<Utc>> {
        if let Some(secs) = self.created {
            return Utc.timestamp_opt(secs, 0).single();
        }
        self.created_at
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Adapter over vendor model listings.
pub struct VendorAdapter {
    client: reqwest::Client,
    providers: Vec<VendorProvider>,
}

impl VendorAdapter {
    pub fn new(client: reqwest::Client, config: &VendorConfig) -> Self {
        Self {
            client,
            providers: config.providers.clone(),
        }
    }

    fn request(&self, provider: &VendorProvider, after_id: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.client.get(&provider.url);
        if let Some(after) = after_id {
            request = request.query(&[("after_id", after)]);
        }
        if let Some(ref key) = provider.api_key {
            request = match provider.auth {
                VendorAuth::Bearer => request.bearer_auth(key),
                VendorAuth::XApiKey => request.header("x-api-key", key),
            };
        }
        for (name, value) in &provider.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn next_provider(&self, index: usize) -> Option<String> {
        let next = index + 1;
        (next < self.providers.len()).then(|| next.to_string())
    }
}

fn to_item(provider: &VendorProvider, entry: ModelEntry) -> RawItem {
    let created = entry.created();
    let title = entry
        .display_name
        .clone()
        .unwrap_or_else(|| entry.id.clone());
    RawItem {
        source: KIND,
        external_id: format!("{}/{}", provider.name, entry.id),
        kind: EntityKind::Model,
        title,
        url: None,
        published_at: created,
        content: json!({
            "vendor": provider.name,
            "model_id": entry.id,
            "owned_by": entry.owned_by,
            "created": created,
        }),
        metrics: Value::Object(Default::default()),
    }
}

#[async_trait]
impl SourceAdapter for VendorAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn fetch(
        &self,
        _since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, SourceError> {
        let (index, after_id) = split_cursor(KIND, cursor)?;
        let Some(provider) = self.providers.get(index) else {
            return Ok(Page::default());
        };

        if provider.api_key_env.is_some() && provider.api_key.is_none() {
            warn!("Skipping vendor {}: no API key configured", provider.name);
            return Ok(Page {
                items: Vec::new(),
                next_cursor: self.next_provider(index),
            });
        }

        let listing: ListResponse =
            get_json(KIND, self.request(provider, after_id.as_deref())).await?;
        debug!(
            vendor = %provider.name,
            models = listing.data.len(),
            has_more = listing.has_more,
            "Fetched vendor model listing"
        );

        let next_cursor = match (listing.has_more, listing.last_id) {
            (true, Some(last)) => Some(format!("{}:{}", index, last)),
            _ => self.next_provider(index),
        };
        let items = listing
            .data
            .into_iter()
            .map(|entry| to_item(provider, entry))
            .collect();

        Ok(Page { items, next_cursor })
    }
}
