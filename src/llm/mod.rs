//! LLM clients.
//!
//! The analyzer only needs a single-turn completion: a system prompt plus a
//! user prompt in, the model's reply text out.

pub mod ollama;
pub mod openai;

use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// A chat message as both supported APIs expect it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

/// A chat model that answers one prompt at a time.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model name, recorded in logs and reports.
    fn model(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

/// Build the client selected by `config.provider`.
pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, ConfigError> {
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to create HTTP client: {}", e)))?;

    match config.provider.to_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaClient::new(http_client, config))),
        "openai" | "openai-compatible" => {
            Ok(Arc::new(OpenAiClient::new(http_client, config)))
        }
        other => Err(ConfigError::UnsupportedProvider(other.to_string())),
    }
}

/// Map a transport error the way both clients report it.
pub(crate) fn send_error(e: reqwest::Error, base_url: &str, timeout_seconds: u64) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout_seconds)
    } else if e.is_connect() {
        LlmError::Connect(base_url.to_string())
    } else {
        LlmError::Request(e.to_string())
    }
}

/// Check the status and decode the JSON body.
pub(crate) async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, LlmError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Api { status, body });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| LlmError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_by_provider() {
        let mut config = LlmConfig::default();
        config.provider = "ollama".to_string();
        assert!(build_client(&config).is_ok());

        config.provider = "OpenAI".to_string();
        assert!(build_client(&config).is_ok());

        config.provider = "carrier-pigeon".to_string();
        assert!(matches!(
            build_client(&config).err(),
            Some(ConfigError::UnsupportedProvider(_))
        ));
    }
}
