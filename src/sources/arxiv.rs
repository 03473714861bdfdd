//! arXiv preprint adapter.
//!
//! Queries the Atom export API per category, newest submissions first.
//! The cursor is `{category_index}:{start}`. A category is finished when a
//! page comes back short, when an entry older than the watermark shows up,
//! or when `max_items` entries have been read.

use super::http::get_text;
use super::{split_cursor, Page, RawItem, SourceAdapter};
use crate::config::ArxivConfig;
use crate::error::SourceError;
use crate::models::{EntityKind, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

const KIND: SourceKind = SourceKind::Arxiv;

/// One `<entry>` of an Atom feed.
#[derive(Debug, Clone, PartialEq)]
struct AtomEntry {
    id: String,
    title: String,
    summary: String,
    updated: Option<DateTime<Utc>>,
    published: Option<DateTime<Utc>>,
    authors: Vec<String>,
}

/// Adapter over `export.arxiv.org/api/query`.
pub struct ArxivAdapter {
    client: reqwest::Client,
    api_url: String,
    categories: Vec<String>,
    max_items: usize,
    page_size: usize,
}

impl ArxivAdapter {
    pub fn new(client: reqwest::Client, config: &ArxivConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            categories: config.categories.clone(),
            max_items: config.max_items.max(1),
            page_size: config.page_size.clamp(1, config.max_items.max(1)),
        }
    }

    fn next_category(&self, index: usize) -> Option<String> {
        let next = index + 1;
        (next < self.categories.len()).then(|| next.to_string())
    }
}

#[async_trait]
impl SourceAdapter for ArxivAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, SourceError> {
        let (index, start) = split_cursor(KIND, cursor)?;
        let Some(category) = self.categories.get(index) else {
            return Ok(Page::default());
        };
        let start = match start {
            Some(s) => s
                .parse::<usize>()
                .map_err(|_| SourceError::unavailable(KIND, format!("invalid cursor offset '{}'", s)))?,
            None => 0,
        };

        let query = format!("cat:{}", category);
        let start_param = start.to_string();
        let max_results = self.page_size.min(self.max_items.saturating_sub(start)).max(1);
        let max_param = max_results.to_string();
        let request = self.client.get(&self.api_url).query(&[
            ("search_query", query.as_str()),
            ("sortBy", "submittedDate"),
            ("sortOrder", "descending"),
            ("start", start_param.as_str()),
            ("max_results", max_param.as_str()),
        ]);

        let body = get_text(KIND, request).await?;
        let entries = parse_feed(&body);
        let returned = entries.len();

        let mut reached_watermark = false;
        let mut items = Vec::with_capacity(returned);
        for entry in entries {
            if let (Some(since), Some(updated)) = (since, entry.updated) {
                if updated < since {
                    reached_watermark = true;
                    continue;
                }
            }
            items.push(to_item(entry));
        }
        debug!(category = %category, start, returned, kept = items.len(), "Fetched arXiv entries");

        let consumed = start + returned;
        let category_done =
            reached_watermark || returned < max_results || consumed >= self.max_items;
        let next_cursor = if category_done {
            self.next_category(index)
        } else {
            Some(format!("{}:{}", index, consumed))
        };

        Ok(Page { items, next_cursor })
    }
}

fn to_item(entry: AtomEntry) -> RawItem {
    RawItem {
        source: KIND,
        external_id: paper_id(&entry.id),
        kind: EntityKind::Paper,
        title: entry.title.clone(),
        url: Some(entry.id),
        published_at: entry.published,
        content: json!({
            "title": entry.title,
            "summary": entry.summary,
            "updated": entry.updated,
            "authors": entry.authors,
        }),
        metrics: json!({}),
    }
}

/// `http://arxiv.org/abs/2401.01234v2` → `2401.01234`.
fn paper_id(id: &str) -> String {
    let tail = id.rsplit_once("/abs/").map(|(_, t)| t).unwrap_or(id);
    match tail.rsplit_once('v') {
        Some((base, version))
            if !base.is_empty()
                && !version.is_empty()
                && version.chars().all(|c| c.is_ascii_digit()) =>
        {
            base.to_string()
        }
        _ => tail.to_string(),
    }
}

/// Reduce an Atom feed to its entries. Only the handful of elements the
/// pipeline needs are extracted.
fn parse_feed(xml: &str) -> Vec<AtomEntry> {
    blocks(xml, "entry")
        .into_iter()
        .filter_map(|block| {
            let id = element_text(block, "id")?;
            Some(AtomEntry {
                id,
                title: element_text(block, "title").unwrap_or_default(),
                summary: element_text(block, "summary").unwrap_or_default(),
                updated: element_text(block, "updated").and_then(|t| parse_time(&t)),
                published: element_text(block, "published").and_then(|t| parse_time(&t)),
                authors: blocks(block, "author")
                    .into_iter()
                    .filter_map(|a| element_text(a, "name"))
                    .collect(),
            })
        })
        .collect()
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Inner text of every `<tag ...>...</tag>` in `xml`.
fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = xml;

    while let Some(pos) = rest.find(&open) {
        let after = &rest[pos + open.len()..];
        // Skip longer tag names sharing the prefix, e.g. <entry> vs <entryX>.
        if !after.starts_with(['>', ' ', '\n', '\t', '\r', '/']) {
            rest = after;
            continue;
        }
        let Some(gt) = after.find('>') else { break };
        if after[..gt].ends_with('/') {
            out.push("");
            rest = &after[gt + 1..];
            continue;
        }
        let body = &after[gt + 1..];
        let Some(end) = body.find(&close) else { break };
        out.push(&body[..end]);
        rest = &body[end + close.len()..];
    }
    out
}

/// Whitespace-collapsed, decoded text of the first `<tag>` in `xml`.
fn element_text(xml: &str, tag: &str) -> Option<String> {
    let raw = blocks(xml, tag).into_iter().next()?;
    let text = decode_text(raw);
    Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Character data with references decoded. CDATA sections are copied
/// verbatim.
fn decode_text(raw: &str) -> String {
    const CDATA_OPEN: &str = "<![CDATA[";
    const CDATA_CLOSE: &str = "]]>";

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find(CDATA_OPEN) {
        out.push_str(&unescape(&rest[..start]));
        let body = &rest[start + CDATA_OPEN.len()..];
        match body.find(CDATA_CLOSE) {
            Some(end) => {
                out.push_str(&body[..end]);
                rest = &body[end + CDATA_CLOSE.len()..];
            }
            None => {
                out.push_str(body);
                rest = "";
            }
        }
    }
    out.push_str(&unescape(rest));
    out
}

/// Decode entity and character references in one pass. Unknown or
/// malformed references are kept as written.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .and_then(|semi| reference(&tail[1..semi]).map(|c| (c, semi + 1)));
        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn reference(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
