//! Shared HTTP response helpers for source adapters.
//!
//! Maps provider status codes onto [`SourceError`]: throttling becomes
//! `RateLimited` with the provider's retry hint, any other non-success
//! becomes `Unavailable`.

use crate::error::SourceError;
use crate::models::SourceKind;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Check an HTTP response for throttling and error statuses.
pub async fn check_response(
    provider: SourceKind,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status == 429 || (status == 403 && quota_exhausted(resp.headers())) {
        return Err(SourceError::RateLimited {
            provider,
            retry_after: retry_after(resp.headers(), Utc::now().timestamp()),
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SourceError::unavailable(
            provider,
            format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)),
        ));
    }
    Ok(resp)
}

/// Send `request`, check the status and decode the JSON body.
pub async fn get_json<T: DeserializeOwned>(
    provider: SourceKind,
    request: reqwest::RequestBuilder,
) -> Result<T, SourceError> {
    let resp = request.send().await.map_err(|e| request_error(provider, e))?;
    let resp = check_response(provider, resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| SourceError::unavailable(provider, format!("invalid response body: {}", e)))
}

/// Send `request`, check the status and return the body as text.
pub async fn get_text(
    provider: SourceKind,
    request: reqwest::RequestBuilder,
) -> Result<String, SourceError> {
    let resp = request.send().await.map_err(|e| request_error(provider, e))?;
    let resp = check_response(provider, resp).await?;
    resp.text()
        .await
        .map_err(|e| SourceError::unavailable(provider, format!("failed to read body: {}", e)))
}

pub fn request_error(provider: SourceKind, e: reqwest::Error) -> SourceError {
    let reason = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };
    SourceError::unavailable(provider, reason)
}

/// GitHub signals an exhausted quota with 403 and `x-ratelimit-remaining: 0`.
fn quota_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        == Some(0)
}

/// `Retry-After` seconds, else `x-ratelimit-reset` (epoch seconds) relative
/// to `now`, else 60 s.
fn retry_after(headers: &HeaderMap, now: i64) -> Duration {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    let secs = header("retry-after")
        .map(|s| s.max(0) as u64)
        .or_else(|| header("x-ratelimit-reset").map(|reset| (reset - now).max(1) as u64))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
