//! Hugging Face Hub model adapter.
//!
//! Lists the most recently modified models for each configured tag. One
//! page per tag; the cursor is the index of the next tag.

use super::http::get_json;
use super::{split_cursor, Page, RawItem, SourceAdapter};
use crate::config::HuggingFaceConfig;
use crate::error::SourceError;
use crate::models::{EntityKind, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const KIND: SourceKind = SourceKind::Huggingface;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    id: Option<String>,
    model_id: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "pipeline_tag")]
    pipeline_tag: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "library_name")]
    library_name: Option<String>,
    author: Option<String>,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
}

/// Adapter over the Hub's `/api/models` listing.
pub struct HuggingFaceAdapter {
    client: reqwest::Client,
    api_url: String,
    tags: Vec<String>,
    token: Option<String>,
    max_items: usize,
}

impl HuggingFaceAdapter {
    pub fn new(client: reqwest::Client, config: &HuggingFaceConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            tags: config.tags.clone(),
            token: config.token.clone(),
            max_items: config.max_items.max(1),
        }
    }

    fn to_item(&self, model: ModelInfo) -> Option<RawItem> {
        let id = model.id.or(model.model_id)?;
        Some(RawItem {
            source: KIND,
            external_id: id.clone(),
            kind: EntityKind::Model,
            url: Some(format!("https://huggingface.co/{}", id)),
            title: id,
            published_at: model.created_at,
            content: json!({
                "last_modified": model.last_modified,
                "pipeline_tag": model.pipeline_tag,
                "tags": model.tags,
                "library": model.library_name,
                "author": model.author,
            }),
            metrics: json!({
                "downloads": model.downloads,
                "likes": model.likes,
            }),
        })
    }
}

#[async_trait]
impl SourceAdapter for HuggingFaceAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, SourceError> {
        let (index, _) = split_cursor(KIND, cursor)?;
        let Some(tag) = self.tags.get(index) else {
            return Ok(Page::default());
        };

        let url = format!("{}/api/models", self.api_url);
        let limit = self.max_items.to_string();
        let mut request = self.client.get(&url).query(&[
            ("filter", tag.as_str()),
            ("sort", "lastModified"),
            ("direction", "-1"),
            ("limit", limit.as_str()),
            ("full", "true"),
        ]);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let models: Vec<ModelInfo> = get_json(KIND, request).await?;
        let total = models.len();
        let items: Vec<RawItem> = models
            .into_iter()
            .filter(|m| match (since, m.last_modified) {
                (Some(since), Some(modified)) => modified >= since,
                _ => true,
            })
            .filter_map(|m| self.to_item(m))
            .collect();
        debug!(tag = %tag, total, kept = items.len(), "Fetched Hugging Face models");

        let next = index + 1;
        Ok(Page {
            items,
            next_cursor: (next < self.tags.len()).then(|| next.to_string()),
        })
    }
}
