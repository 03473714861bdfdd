//! Error types for the pipeline.
//!
//! Source and analysis errors are isolated and recorded; only store and
//! configuration errors abort a run.

use crate::models::SourceKind;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a source adapter.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Network, auth, server or parse failure. The source is retried next run.
    #[error("{provider} unavailable: {reason}")]
    Unavailable { provider: SourceKind, reason: String },

    /// The provider throttled us.
    #[error("{provider} rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        provider: SourceKind,
        retry_after: Duration,
    },
}

impl SourceError {
    pub fn unavailable(provider: SourceKind, reason: impl Into<String>) -> Self {
        SourceError::Unavailable {
            provider,
            reason: reason.into(),
        }
    }
}

/// Errors raised by the memory store. Always fatal to the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),

    #[error("memory store journal corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Errors raised while calling the LLM.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("cannot connect to LLM endpoint at {0}")]
    Connect(String),

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to send request: {0}")]
    Request(String),

    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    #[error("LLM returned an empty response")]
    Empty,
}

/// Errors raised while handing reports to a sink.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Invalid configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unsupported LLM provider: {0}")]
    UnsupportedProvider(String),
}
