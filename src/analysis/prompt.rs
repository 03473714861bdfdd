//! Prompt construction for entity analysis.

use crate::models::{Entity, HistoryRecord};
use serde_json::Value;

/// System prompt sent with every analysis request.
pub const SYSTEM_PROMPT: &str = r#"You are an analyst tracking AI model, repository and paper releases.
Given the current state of one tracked item and its recent history, describe
what is new or changed and why it matters.

Respond with ONE JSON object and nothing else:
{"summary": "<2-4 sentences>", "metrics": {"<name>": <number or short string>}}

Useful metric names: "novelty" (0-10), "momentum" (0-10), "architecture",
"parameter_count", "license". Omit metrics you cannot infer."#;

/// Longest snapshot rendering included per history record.
const MAX_SNAPSHOT_CHARS: usize = 4_000;

/// Build the user prompt for `entity` from its history (most recent first).
pub fn build_prompt(entity: &Entity, history: &[HistoryRecord]) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("Item: {}\n", entity.title));
    prompt.push_str(&format!("Source: {}\n", entity.source));
    prompt.push_str(&format!("Kind: {}\n", entity.kind));
    if let Some(ref url) = entity.url {
        prompt.push_str(&format!("URL: {}\n", url));
    }
    prompt.push_str(&format!(
        "First seen: {}\n",
        entity.first_seen_at.format("%Y-%m-%d")
    ));

    match history.split_first() {
        None => prompt.push_str("\nNo snapshot recorded.\n"),
        Some((current, previous)) => {
            prompt.push_str("\n=== CURRENT STATE ===\n");
            prompt.push_str(&render_snapshot(&current.snapshot));
            prompt.push('\n');

            if previous.is_empty() {
                prompt.push_str("\nThis item is new; there is no earlier history.\n");
            } else {
                prompt.push_str(&format!(
                    "\n=== EARLIER STATES ({} most recent first) ===\n",
                    previous.len()
                ));
                for record in previous {
                    prompt.push_str(&format!(
                        "--- observed {} ---\n{}\n",
                        record.observed_at.format("%Y-%m-%d %H:%M"),
                        render_snapshot(&record.snapshot)
                    ));
                }
            }
        }
    }

    prompt.push_str("\nNow respond with the JSON object:");
    prompt
}

fn render_snapshot(snapshot: &Value) -> String {
    let rendered = serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| snapshot.to_string());
    if rendered.len() <= MAX_SNAPSHOT_CHARS {
        return rendered;
    }
    let mut end = MAX_SNAPSHOT_CHARS;
    while !rendered.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &rendered[..end])
}
