//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::{RunMode, SourceKind};
use clap::Parser;
use std::path::PathBuf;

/// ai-insight - track AI repositories, models and papers
///
/// Collects new and changed items from GitHub, Hugging Face, arXiv and
/// vendor model listings, analyzes them with an LLM against their history,
/// and writes JSON trend and model reports.
///
/// Exit codes: 0 ok, 2 partial run, 1 fatal or configuration error.
///
/// Examples:
///   ai-insight
///   ai-insight --mode collect-only --sources github,arxiv
///   ai-insight --mode report-only --reports-dir ./out
///   ai-insight --provider openai --llm-url https://api.openai.com --model gpt-4o-mini
///   ai-insight --status
///   ai-insight --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Which stages to run
    #[arg(long, default_value = "full", value_name = "MODE")]
    pub mode: ModeArg,

    /// Path to configuration file
    ///
    /// If not specified, looks for .ai-insight.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Directory of the memory store
    #[arg(long, value_name = "DIR", env = "AI_INSIGHT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory reports are written to
    #[arg(long, value_name = "DIR")]
    pub reports_dir: Option<PathBuf>,

    /// LLM provider (ollama, openai, openai-compatible)
    #[arg(long, value_name = "NAME")]
    pub provider: Option<String>,

    /// Model used for analysis
    #[arg(short, long, env = "AI_INSIGHT_MODEL")]
    pub model: Option<String>,

    /// Base URL of the LLM API
    #[arg(long, value_name = "URL", env = "AI_INSIGHT_LLM_URL")]
    pub llm_url: Option<String>,

    /// Only collect from these sources (comma-separated)
    ///
    /// Example: --sources github,huggingface
    #[arg(long, value_name = "SOURCES", value_delimiter = ',')]
    pub sources: Option<Vec<SourceKind>>,

    /// Concurrent source fetches and analyses
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// History records given to the LLM per entity
    #[arg(long, value_name = "COUNT")]
    pub history_depth: Option<usize>,

    /// Print the most recent runs and exit
    #[arg(long, conflicts_with = "init_config")]
    pub status: bool,

    /// Generate a default .ai-insight.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Run mode as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ModeArg {
    /// Collect, analyze and report (default)
    #[default]
    Full,
    /// Only fetch and diff sources
    CollectOnly,
    /// Only analyze pending entities
    AnalyzeOnly,
    /// Only rebuild reports from the latest analyzed run
    ReportOnly,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => RunMode::Full,
            ModeArg::CollectOnly => RunMode::CollectOnly,
            ModeArg::AnalyzeOnly => RunMode::AnalyzeOnly,
            ModeArg::ReportOnly => RunMode::ReportOnly,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn run_mode(&self) -> RunMode {
        self.mode.into()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        // Validate LLM URL format
        if let Some(ref url) = self.llm_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("LLM URL must start with 'http://' or 'https://'".to_string());
            }
        }

        // Validate concurrency
        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.history_depth == Some(0) {
            return Err("History depth must be at least 1".to_string());
        }

        if let Some(ref sources) = self.sources {
            if sources.is_empty() {
                return Err("--sources needs at least one source".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
