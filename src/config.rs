//! Configuration file handling.
//!
//! This module handles loading `.ai-insight.toml`, filling secrets from the
//! environment and merging command-line overrides on top.

use crate::analysis::AnalyzerConfig;
use crate::collector::CollectorConfig;
use crate::error::ConfigError;
use crate::pipeline::PipelineSettings;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".ai-insight.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub sources: SourcesConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory the JSON reports are written to.
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            reports_dir: default_reports_dir(),
        }
    }
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

/// Memory store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the store journal.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/memory")
}

/// LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `ollama`, `openai` or `openai-compatible`.
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_llm_url")]
    pub base_url: String,

    /// Usually taken from the environment rather than the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_llm_url(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            timeout_seconds: default_llm_timeout(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_llm_timeout() -> u64 {
    300
}

/// Pipeline tuning: concurrency, retries and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// History records handed to the LLM as context.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    /// Total attempts per source page.
    #[serde(default = "default_attempts")]
    pub source_attempts: u32,

    /// Total attempts per entity analysis.
    #[serde(default = "default_attempts")]
    pub analysis_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_concurrency")]
    pub source_concurrency: usize,

    #[serde(default = "default_concurrency")]
    pub analysis_concurrency: usize,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,

    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_seconds: u64,

    #[serde(default = "default_analyze_timeout")]
    pub analyze_timeout_seconds: u64,

    #[serde(default = "default_report_timeout")]
    pub report_timeout_seconds: u64,

    /// Rate-limit hints longer than this defer the source to the next run.
    #[serde(default = "default_max_rate_limit_wait")]
    pub max_rate_limit_wait_seconds: u64,

    /// Pages fetched per source per run.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_depth: default_history_depth(),
            source_attempts: default_attempts(),
            analysis_attempts: default_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: true,
            source_concurrency: default_concurrency(),
            analysis_concurrency: default_concurrency(),
            fetch_timeout_seconds: default_fetch_timeout(),
            collect_timeout_seconds: default_collect_timeout(),
            analyze_timeout_seconds: default_analyze_timeout(),
            report_timeout_seconds: default_report_timeout(),
            max_rate_limit_wait_seconds: default_max_rate_limit_wait(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_history_depth() -> usize {
    5
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_collect_timeout() -> u64 {
    600
}

fn default_analyze_timeout() -> u64 {
    1800 // large local models are slow
}

fn default_report_timeout() -> u64 {
    60
}

fn default_max_rate_limit_wait() -> u64 {
    120
}

fn default_max_pages() -> usize {
    100
}

/// Per-provider source settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub github: GithubConfig,

    #[serde(default)]
    pub huggingface: HuggingFaceConfig,

    #[serde(default)]
    pub arxiv: ArxivConfig,

    #[serde(default)]
    pub vendor: VendorConfig,
}

/// GitHub repositories to track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `owner/name` pairs.
    #[serde(default = "default_repos")]
    pub repos: Vec<String>,

    /// Filled from `GITHUB_TOKEN` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_github_max_items")]
    pub max_items: usize,

    #[serde(default = "default_github_url")]
    pub api_url: String,

    /// Also fetch the latest release of each repository.
    #[serde(default = "default_true")]
    pub include_releases: bool,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repos: default_repos(),
            token: None,
            max_items: default_github_max_items(),
            api_url: default_github_url(),
            include_releases: true,
        }
    }
}

fn default_repos() -> Vec<String> {
    vec![
        "huggingface/transformers",
        "openai/whisper",
        "facebookresearch/llama",
        "microsoft/DeepSpeed",
        "karpathy/nanoGPT",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_github_max_items() -> usize {
    50
}

fn default_github_url() -> String {
    "https://api.github.com".to_string()
}

/// Hugging Face model hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuggingFaceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Each tag is queried separately.
    #[serde(default = "default_hf_tags")]
    pub tags: Vec<String>,

    /// Filled from `HUGGINGFACE_TOKEN` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Models per tag.
    #[serde(default = "default_hf_max_items")]
    pub max_items: usize,

    #[serde(default = "default_hf_url")]
    pub api_url: String,
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tags: default_hf_tags(),
            token: None,
            max_items: default_hf_max_items(),
            api_url: default_hf_url(),
        }
    }
}

fn default_hf_tags() -> Vec<String> {
    vec!["transformers", "pytorch", "text-generation", "llm"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_hf_max_items() -> usize {
    100
}

fn default_hf_url() -> String {
    "https://huggingface.co".to_string()
}

/// arXiv categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArxivConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// Papers per category per run.
    #[serde(default = "default_arxiv_max_items")]
    pub max_items: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_arxiv_url")]
    pub api_url: String,
}

impl Default for ArxivConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            categories: default_categories(),
            max_items: default_arxiv_max_items(),
            page_size: default_page_size(),
            api_url: default_arxiv_url(),
        }
    }
}

fn default_categories() -> Vec<String> {
    vec!["cs.AI", "cs.LG", "cs.CL", "cs.CV", "cs.NE"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_arxiv_max_items() -> usize {
    50
}

fn default_page_size() -> usize {
    25
}

fn default_arxiv_url() -> String {
    "http://export.arxiv.org/api/query".to_string()
}

/// Vendor model-listing APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_vendor_providers")]
    pub providers: Vec<VendorProvider>,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            providers: default_vendor_providers(),
        }
    }
}

/// How a vendor expects its API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorAuth {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// `x-api-key: <key>`
    XApiKey,
}

/// One vendor listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProvider {
    pub name: String,
    pub url: String,

    /// Environment variable holding the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub auth: VendorAuth,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_vendor_providers() -> Vec<VendorProvider> {
    vec![
        VendorProvider {
            name: "openai".to_string(),
            url: "https://api.openai.com/v1/models".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            api_key: None,
            auth: VendorAuth::Bearer,
            headers: BTreeMap::new(),
        },
        VendorProvider {
            name: "anthropic".to_string(),
            url: "https://api.anthropic.com/v1/models".to_string(),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            api_key: None,
            auth: VendorAuth::XApiKey,
            headers: BTreeMap::from([(
                "anthropic-version".to_string(),
                "2023-06-01".to_string(),
            )]),
        },
    ]
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Fill unset secrets from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    /// Fill unset secrets using `lookup` for environment variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let github = &mut self.sources.github;
        if github.token.is_none() {
            github.token = lookup("GITHUB_TOKEN");
        }

        let huggingface = &mut self.sources.huggingface;
        if huggingface.token.is_none() {
            huggingface.token = lookup("HUGGINGFACE_TOKEN");
        }

        if self.llm.api_key.is_none() {
            self.llm.api_key = lookup("AI_INSIGHT_LLM_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }

        for provider in &mut self.sources.vendor.providers {
            if provider.api_key.is_none() {
                provider.api_key = provider.api_key_env.as_deref().and_then(&lookup);
            }
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.data_dir {
            self.memory.data_dir = dir.clone();
        }
        if let Some(ref dir) = args.reports_dir {
            self.general.reports_dir = dir.clone();
        }

        // LLM settings
        if let Some(ref provider) = args.provider {
            self.llm.provider = provider.clone();
        }
        if let Some(ref model) = args.model {
            self.llm.model = model.clone();
        }
        if let Some(ref url) = args.llm_url {
            self.llm.base_url = url.clone();
        }

        // Pipeline settings
        if let Some(concurrency) = args.concurrency {
            self.pipeline.source_concurrency = concurrency;
            self.pipeline.analysis_concurrency = concurrency;
        }
        if let Some(depth) = args.history_depth {
            self.pipeline.history_depth = depth;
        }

        // Restrict to the listed sources
        if let Some(ref only) = args.sources {
            use crate::models::SourceKind;
            self.sources.github.enabled &= only.contains(&SourceKind::Github);
            self.sources.huggingface.enabled &= only.contains(&SourceKind::Huggingface);
            self.sources.arxiv.enabled &= only.contains(&SourceKind::Arxiv);
            self.sources.vendor.enabled &= only.contains(&SourceKind::Vendor);
        }
    }

    /// Check the merged configuration before any stage runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.llm.provider.to_lowercase().as_str() {
            "ollama" | "openai" | "openai-compatible" => {}
            other => return Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
        if !is_http_url(&self.llm.base_url) {
            return Err(ConfigError::Invalid(
                "llm.base_url must start with 'http://' or 'https://'".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(
                "llm.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "llm.timeout_seconds must be at least 1".to_string(),
            ));
        }

        let p = &self.pipeline;
        if p.source_concurrency == 0 || p.analysis_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if p.source_attempts == 0 || p.analysis_attempts == 0 {
            return Err(ConfigError::Invalid("attempts must be at least 1".to_string()));
        }
        if p.history_depth == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.history_depth must be at least 1".to_string(),
            ));
        }
        if p.backoff_base_ms > p.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "pipeline.backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        let timeouts = [
            p.fetch_timeout_seconds,
            p.collect_timeout_seconds,
            p.analyze_timeout_seconds,
            p.report_timeout_seconds,
        ];
        if timeouts.contains(&0) {
            return Err(ConfigError::Invalid("timeouts must be at least 1 second".to_string()));
        }
        if p.max_pages == 0 {
            return Err(ConfigError::Invalid("pipeline.max_pages must be at least 1".to_string()));
        }

        let s = &self.sources;
        for (name, url) in [
            ("sources.github.api_url", &s.github.api_url),
            ("sources.huggingface.api_url", &s.huggingface.api_url),
            ("sources.arxiv.api_url", &s.arxiv.api_url),
        ] {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(format!(
                    "{} must start with 'http://' or 'https://'",
                    name
                )));
            }
        }
        if let Some(repo) = s.github.repos.iter().find(|r| r.split('/').count() != 2) {
            return Err(ConfigError::Invalid(format!(
                "GitHub repository '{}' must be in owner/name form",
                repo
            )));
        }
        if s.arxiv.page_size == 0 {
            return Err(ConfigError::Invalid(
                "sources.arxiv.page_size must be at least 1".to_string(),
            ));
        }
        for provider in &s.vendor.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Invalid("vendor provider without a name".to_string()));
            }
            if !is_http_url(&provider.url) {
                return Err(ConfigError::Invalid(format!(
                    "vendor provider '{}' has an invalid url",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    fn retry_policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(self.pipeline.backoff_base_ms),
            max_delay: Duration::from_millis(self.pipeline.backoff_max_ms),
            jitter: self.pipeline.jitter,
            ..RetryPolicy::default()
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            concurrency: self.pipeline.source_concurrency,
            fetch_timeout: Duration::from_secs(self.pipeline.fetch_timeout_seconds),
            retry: self.retry_policy(self.pipeline.source_attempts),
            max_rate_limit_wait: Duration::from_secs(self.pipeline.max_rate_limit_wait_seconds),
            max_pages: self.pipeline.max_pages,
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            concurrency: self.pipeline.analysis_concurrency,
            history_depth: self.pipeline.history_depth,
            call_timeout: Duration::from_secs(self.llm.timeout_seconds),
            retry: self.retry_policy(self.pipeline.analysis_attempts),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            collect_timeout: Duration::from_secs(self.pipeline.collect_timeout_seconds),
            analyze_timeout: Duration::from_secs(self.pipeline.analyze_timeout_seconds),
            report_timeout: Duration::from_secs(self.pipeline.report_timeout_seconds),
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
