//! GitHub repository adapter.
//!
//! Tracks a configured list of repositories. Each page covers one
//! repository; the cursor is the index of the next one.

use super::http::{check_response, get_json, request_error};
use super::{split_cursor, Page, RawItem, SourceAdapter};
use crate::config::GithubConfig;
use crate::error::SourceError;
use crate::models::{EntityKind, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const KIND: SourceKind = SourceKind::Github;

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
    html_url: Option<String>,
    description: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    license: Option<License>,
    default_branch: Option<String>,
    pushed_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    archived: bool,
    homepage: Option<String>,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    open_issues_count: u64,
}

#[derive(Debug, Deserialize)]
struct License {
    spdx_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

/// Adapter over the GitHub REST API.
pub struct GithubAdapter {
    client: reqwest::Client,
    api_url: String,
    repos: Vec<String>,
    token: Option<String>,
    include_releases: bool,
}

impl GithubAdapter {
    pub fn new(client: reqwest::Client, config: &GithubConfig) -> Self {
        let mut repos = config.repos.clone();
        repos.truncate(config.max_items);
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            repos,
            token: config.token.clone(),
            include_releases: config.include_releases,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn latest_release(&self, repo: &str) -> Result<Option<String>, SourceError> {
        let url = format!("{}/repos/{}/releases/latest", self.api_url, repo);
        let resp = self.get(&url).send().await.map_err(|e| request_error(KIND, e))?;
        if resp.status() == 404 {
            return Ok(None);
        }
        let resp = check_response(KIND, resp).await?;
        let release: ReleaseResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::unavailable(KIND, format!("invalid release body: {}", e)))?;
        Ok(Some(release.tag_name))
    }

    async fn fetch_repo(&self, repo: &str) -> Result<RawItem, SourceError> {
        let url = format!("{}/repos/{}", self.api_url, repo);
        let info: RepoResponse = get_json(KIND, self.get(&url)).await?;

        let latest_release = if self.include_releases {
            self.latest_release(repo).await?
        } else {
            None
        };

        Ok(RawItem {
            source: KIND,
            external_id: info.full_name.clone(),
            kind: EntityKind::Repository,
            title: info.full_name,
            url: info.html_url,
            published_at: info.created_at,
            content: json!({
                "description": info.description,
                "topics": info.topics,
                "license": info.license.and_then(|l| l.spdx_id),
                "default_branch": info.default_branch,
                "pushed_at": info.pushed_at,
                "archived": info.archived,
                "homepage": info.homepage,
                "language": info.language,
                "latest_release": latest_release,
            }),
            metrics: json!({
                "stars": info.stargazers_count,
                "forks": info.forks_count,
                "open_issues": info.open_issues_count,
            }),
        })
    }
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn fetch(
        &self,
        _since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, SourceError> {
        let (index, _) = split_cursor(KIND, cursor)?;
        let Some(repo) = self.repos.get(index) else {
            return Ok(Page::default());
        };

        debug!("Fetching GitHub repository {}", repo);
        let item = self.fetch_repo(repo).await?;

        let next = index + 1;
        Ok(Page {
            items: vec![item],
            next_cursor: (next < self.repos.len()).then(|| next.to_string()),
        })
    }
}
