//! Parsing of LLM analysis replies.

use crate::error::LlmError;
use crate::models::MetricValue;
use serde_json::Value;
use std::collections::BTreeMap;

/// Summary and metrics extracted from one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnalysis {
    pub summary: String,
    pub metrics: BTreeMap<String, MetricValue>,
}

/// Parse a reply. The first JSON object carrying a `summary` wins; a reply
/// without one becomes the summary verbatim. Empty replies are errors.
pub fn parse_response(reply: &str) -> Result<ParsedAnalysis, LlmError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(LlmError::Empty);
    }

    for candidate in json_objects(trimmed) {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(summary) = map.get("summary").and_then(Value::as_str) else {
            continue;
        };
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(LlmError::Empty);
        }

        let metrics = map
            .get("metrics")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(name, value)| metric_value(value).map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        return Ok(ParsedAnalysis {
            summary: summary.to_string(),
            metrics,
        });
    }

    Ok(ParsedAnalysis {
        summary: trimmed.to_string(),
        metrics: BTreeMap::new(),
    })
}

fn metric_value(value: &Value) -> Option<MetricValue> {
    match value {
        Value::Number(n) => n.as_f64().map(MetricValue::Number),
        Value::String(s) => Some(MetricValue::Text(s.clone())),
        Value::Bool(b) => Some(MetricValue::Text(b.to_string())),
        _ => None,
    }
}

/// Balanced `{...}` spans in `text`, in order of appearance. Braces inside
/// JSON strings are ignored.
fn json_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    spans
}
