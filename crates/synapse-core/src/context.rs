// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context management: turn windowing, tool-result dehydration and
//! compression, and token-threshold summarization of the whole window.
//!
//! The store-based scheme keeps the live history small while the loop runs:
//! oversized tool results are captured into the request's store after each
//! round ("dehydration"), replaced in-history by short summaries once the
//! next round starts, and (on the single-model fallback path) restored in
//! full before the final synthesis call ("rehydration").

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use synapse_config::constants::{
    COMPRESSION_THRESHOLD, MAX_DEHYDRATED_PAIRS, SUMMARIZE_TIMEOUT,
};
use synapse_model::{Message, MessageContent, Role};
use synapse_tools::EntityTools;

use crate::plan::is_plan_call;
use crate::request::ToolResultStoreEntry;

/// Marker prefix of the synthetic message that replaces a compressed prefix.
const CONTEXT_SUMMARY_MARKER: &str = "[Context Summary:";

/// External summarization pathway used for window compression.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> anyhow::Result<String>;
}

// ─── Turn windowing ───────────────────────────────────────────────────────────

/// Keep the last `n` turns, where a turn starts at each user-role message.
///
/// Walks backward counting user messages and slices at the nth; when the
/// history holds fewer than `n` turns everything is kept.  Tool responses
/// whose matching tool call fell outside the window are filtered, which
/// also makes the operation idempotent under composition.
pub fn slice_by_turns(messages: &[Message], n: usize) -> Vec<Message> {
    let mut start = 0;
    if n > 0 {
        let mut seen_users = 0;
        for (i, m) in messages.iter().enumerate().rev() {
            if m.role == Role::User {
                seen_users += 1;
                if seen_users == n {
                    start = i;
                    break;
                }
            }
        }
    }
    filter_orphan_tool_responses(messages[start..].to_vec())
}

/// Normalize transport-shaped history (loose JSON values) into typed
/// messages.  Stringified `tool_calls` arrays are converted to records;
/// elements with no usable role or content are dropped.
pub fn normalize_history(values: &[Value]) -> Vec<Message> {
    values
        .iter()
        .filter_map(|v| {
            let role = match v["role"].as_str()? {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => return None,
            };
            let content = match &v["content"] {
                Value::String(s) => MessageContent::Text(s.clone()),
                parts @ Value::Array(_) => serde_json::from_value(parts.clone())
                    .map(MessageContent::Parts)
                    .unwrap_or_else(|_| MessageContent::Text(String::new())),
                _ => MessageContent::Text(String::new()),
            };
            let tool_calls = v
                .get("tool_calls")
                .map(synapse_model::normalize_tool_calls)
                .unwrap_or_default();
            Some(Message {
                role,
                content,
                tool_calls,
                tool_call_id: v["tool_call_id"].as_str().map(str::to_string),
                name: v["name"].as_str().map(str::to_string),
            })
        })
        .collect()
}

/// Drop tool-response messages whose matching tool call is not present on
/// any earlier assistant message in the list.
pub fn filter_orphan_tool_responses(messages: Vec<Message>) -> Vec<Message> {
    let mut known_call_ids: Vec<String> = Vec::new();
    let mut kept = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::Assistant => {
                for tc in &m.tool_calls {
                    known_call_ids.push(tc.id.clone());
                }
                kept.push(m);
            }
            Role::Tool => {
                let paired = m
                    .tool_call_id
                    .as_deref()
                    .map(|id| known_call_ids.iter().any(|k| k == id))
                    .unwrap_or(false);
                if paired {
                    kept.push(m);
                }
            }
            _ => kept.push(m),
        }
    }
    kept
}

// ─── Dehydration / compression / rehydration ──────────────────────────────────

/// Capture oversized tool-response content into the store.
///
/// Runs after every tool round; the in-history message is left unchanged for
/// the current round so the executor model sees the fresh results in full.
pub fn dehydrate_round(
    messages: &[Message],
    round: u32,
    store: &mut HashMap<String, ToolResultStoreEntry>,
) {
    for m in messages {
        if m.role != Role::Tool {
            continue;
        }
        let Some(id) = m.tool_call_id.as_deref() else {
            continue;
        };
        if store.contains_key(id) {
            continue;
        }
        let content = m.content.to_text();
        if content.len() > COMPRESSION_THRESHOLD {
            store.insert(
                id.to_string(),
                ToolResultStoreEntry {
                    tool_name: m.name.clone().unwrap_or_default(),
                    char_count: content.len(),
                    full_content: content,
                    round,
                    compressed: false,
                },
            );
        }
    }
}

/// Replace the in-history content of stored results from rounds before
/// `current_round` with their tool-specific summary (or the default
/// summarizer), marking each store entry compressed.
pub fn compress_older_tool_results(
    messages: &mut [Message],
    current_round: u32,
    store: &mut HashMap<String, ToolResultStoreEntry>,
    tools: &EntityTools,
) {
    for m in messages.iter_mut() {
        if m.role != Role::Tool {
            continue;
        }
        let Some(id) = m.tool_call_id.clone() else {
            continue;
        };
        let Some(entry) = store.get_mut(&id) else {
            continue;
        };
        if entry.compressed || entry.round >= current_round {
            continue;
        }
        let summary = tools
            .get(&entry.tool_name)
            .and_then(|t| t.summarize(&entry.full_content))
            .unwrap_or_else(|| default_summarize(&entry.full_content));
        debug!(
            call_id = %id,
            tool = %entry.tool_name,
            from = entry.char_count,
            to = summary.len(),
            "compressed tool result from earlier round"
        );
        m.content = MessageContent::Text(summary);
        entry.compressed = true;
    }
}

/// Restore every stored tool result back to its full content.
///
/// Used before the fallback-path synthesis call so the primary model sees
/// uncompressed results.  All store entries are marked uncompressed.
pub fn rehydrate(messages: &mut [Message], store: &mut HashMap<String, ToolResultStoreEntry>) {
    for m in messages.iter_mut() {
        if m.role != Role::Tool {
            continue;
        }
        if let Some(entry) = m.tool_call_id.as_deref().and_then(|id| store.get(id)) {
            m.content = MessageContent::Text(entry.full_content.clone());
        }
    }
    for entry in store.values_mut() {
        entry.compressed = false;
    }
}

/// Largest index ≤ `max` that is a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Content-shape-aware default summary for a stored tool result.
///
/// Already-compressed JSON (anything carrying `_compressed: true`) is
/// returned unchanged, so re-summarizing is a byte-for-byte no-op.
pub fn default_summarize(content: &str) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
        if obj.get("_compressed").and_then(Value::as_bool) == Some(true) {
            return content.to_string();
        }
        if obj.get("_type").and_then(Value::as_str) == Some("SearchResponse") {
            if let Some(items) = obj.get("value").and_then(Value::as_array) {
                let compressed: Vec<Value> = items
                    .iter()
                    .map(|item| {
                        let text = item["content"].as_str().unwrap_or_default();
                        let cut = floor_char_boundary(text, 200);
                        let snippet = if cut < text.len() {
                            format!("{}...", &text[..cut])
                        } else {
                            text.to_string()
                        };
                        json!({
                            "searchResultId": item.get("searchResultId").cloned().unwrap_or(Value::Null),
                            "title": item.get("title").cloned().unwrap_or(Value::Null),
                            "url": item.get("url").cloned().unwrap_or(Value::Null),
                            "content": snippet,
                        })
                    })
                    .collect();
                return json!({
                    "_type": "SearchResponse",
                    "_compressed": true,
                    "value": compressed,
                })
                .to_string();
            }
        }
        if let Some(text) = obj.get("content").and_then(Value::as_str) {
            let original_chars = text.len();
            let cut = floor_char_boundary(text, 300);
            let mut out = obj.clone();
            out.insert("content".into(), json!(text[..cut].to_string()));
            out.insert("_compressed".into(), json!(true));
            out.insert("_originalChars".into(), json!(original_chars));
            return Value::Object(out).to_string();
        }
    }
    let cut = floor_char_boundary(content, 500);
    format!(
        "{}\n[Compressed — full content will be restored for final synthesis]",
        &content[..cut]
    )
}

// ─── Tool-history export ──────────────────────────────────────────────────────

/// Extract assistant/tool-response pairs beginning at `start_index` for the
/// request's result data.
///
/// `SetGoals` calls and responses are stripped, oversized responses are
/// compressed, and only the last [`MAX_DEHYDRATED_PAIRS`] pairs are kept
/// (a pair = one assistant message plus its responses).
pub fn dehydrate_tool_history(history: &[Message], start_index: usize) -> Vec<Message> {
    let mut pairs: Vec<(Message, Vec<Message>)> = Vec::new();
    let mut i = start_index.min(history.len());
    while i < history.len() {
        let m = &history[i];
        if m.role == Role::Assistant && m.has_tool_calls() {
            let mut assistant = m.clone();
            assistant
                .tool_calls
                .retain(|tc| !is_plan_call(&tc.name));
            let mut responses = Vec::new();
            let mut j = i + 1;
            while j < history.len() && history[j].role == Role::Tool {
                let resp = &history[j];
                let answers_plan = resp.name.as_deref().map(is_plan_call).unwrap_or(false);
                if !answers_plan {
                    let mut resp = resp.clone();
                    let content = resp.content.to_text();
                    if content.len() > COMPRESSION_THRESHOLD {
                        resp.content = MessageContent::Text(default_summarize(&content));
                    }
                    responses.push(resp);
                }
                j += 1;
            }
            if !assistant.tool_calls.is_empty() {
                pairs.push((assistant, responses));
            }
            i = j;
        } else {
            i += 1;
        }
    }
    let skip = pairs.len().saturating_sub(MAX_DEHYDRATED_PAIRS);
    pairs
        .into_iter()
        .skip(skip)
        .flat_map(|(assistant, responses)| std::iter::once(assistant).chain(responses))
        .collect()
}

// ─── Window compression ───────────────────────────────────────────────────────

/// Estimated prompt tokens for the whole message list.
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimate_tokens).sum()
}

/// Find the split index into `messages` (non-system) such that everything
/// from the index on is kept verbatim.
///
/// Starts `keep_recent` from the end and moves earlier while any kept
/// tool-response's matching tool call lies before the split, iterating until
/// stable so tool-interaction groups are never torn apart.
fn find_safe_split_point(messages: &[Message], keep_recent: usize) -> usize {
    let mut split = messages.len().saturating_sub(keep_recent);
    loop {
        let mut adjusted = split;
        for m in &messages[split..] {
            if m.role != Role::Tool {
                continue;
            }
            let Some(id) = m.tool_call_id.as_deref() else {
                continue;
            };
            if let Some(pos) = messages.iter().position(|a| {
                a.role == Role::Assistant && a.tool_calls.iter().any(|tc| tc.id == id)
            }) {
                adjusted = adjusted.min(pos);
            }
        }
        if adjusted == split {
            return split;
        }
        split = adjusted;
    }
}

/// Render the to-compress region as prose for the summarization pathway.
/// Plan calls are rendered by their extracted goal, tool results by name.
fn render_region_prose(messages: &[Message]) -> String {
    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::User => {
                out.push(format!("User: {}", m.content.to_text()));
            }
            Role::Assistant => {
                if m.has_tool_calls() {
                    for tc in &m.tool_calls {
                        if is_plan_call(&tc.name) {
                            let goal = crate::plan::parse_plan(&tc.arguments)
                                .map(|p| p.goal)
                                .unwrap_or_else(|| "(unparsed)".into());
                            out.push(format!("Plan declared: {goal}"));
                        } else {
                            out.push(format!("Tool call: {}({})", tc.name, tc.arguments));
                        }
                    }
                }
                let text = m.content.to_text();
                if !text.is_empty() {
                    out.push(format!("Assistant: {text}"));
                }
            }
            Role::Tool => {
                let name = m.name.as_deref().unwrap_or("tool");
                let text = m.content.to_text();
                let cut = floor_char_boundary(&text, 500);
                out.push(format!("Result from {name}: {}", &text[..cut]));
            }
            Role::System => {}
        }
    }
    out.join("\n")
}

/// Statistics of one window-compression pass, for the event log.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub compressed_messages: usize,
}

/// Compress the conversation window when it exceeds `threshold` of the
/// model's prompt budget.
///
/// System messages are preserved intact, the last `keep_recent` messages are
/// kept verbatim (widened so tool pairs stay whole), the original user query
/// survives, and the compressed region is replaced by a single
/// `[Context Summary: …]` user message.  Summarizer failure or timeout is
/// non-fatal: the original history is returned unchanged.
pub async fn compress_context_window(
    messages: Vec<Message>,
    max_prompt_tokens: usize,
    keep_recent: usize,
    threshold: f64,
    summarizer: Option<&dyn Summarizer>,
) -> (Vec<Message>, Option<CompressionStats>) {
    let tokens_before = estimate_history_tokens(&messages);
    if max_prompt_tokens == 0 || (tokens_before as f64) <= threshold * max_prompt_tokens as f64 {
        return (messages, None);
    }

    let system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let non_system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let split = find_safe_split_point(&non_system, keep_recent);
    if split == 0 {
        // Nothing old enough to compress.
        return (messages, None);
    }
    let to_compress = &non_system[..split];
    let kept_tail = non_system[split..].to_vec();

    let tool_call_count: usize = to_compress
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.tool_calls.iter().filter(|tc| !is_plan_call(&tc.name)).count())
        .sum();
    let tool_result_count = to_compress
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    let tool_related = to_compress
        .iter()
        .filter(|m| m.role == Role::Tool || (m.role == Role::Assistant && m.has_tool_calls()))
        .count();

    let summary_text = if tool_related >= 2 {
        match summarizer {
            Some(s) => {
                let prose = render_region_prose(to_compress);
                match tokio::time::timeout(SUMMARIZE_TIMEOUT, s.summarize(&prose)).await {
                    Ok(Ok(summary)) => summary,
                    Ok(Err(e)) => {
                        warn!("context summarization failed, keeping uncompressed history: {e}");
                        return (messages, None);
                    }
                    Err(_) => {
                        warn!("context summarization timed out, keeping uncompressed history");
                        return (messages, None);
                    }
                }
            }
            None => String::new(),
        }
    } else {
        String::new()
    };

    // The original user query survives compression verbatim (unless it is
    // already inside the kept tail).
    let original_query = to_compress.iter().find(|m| {
        m.role == Role::User
            && !m
                .content
                .to_text()
                .starts_with(CONTEXT_SUMMARY_MARKER)
    });

    let mut marker = format!(
        "{CONTEXT_SUMMARY_MARKER} {tool_call_count} tool calls and {tool_result_count} results \
         from earlier in this conversation were compressed]"
    );
    if !summary_text.is_empty() {
        marker.push_str("\n\n");
        marker.push_str(&summary_text);
    }

    let mut rebuilt = system;
    if let Some(q) = original_query {
        rebuilt.push(q.clone());
    }
    rebuilt.push(Message::user(marker));
    rebuilt.extend(filter_orphan_tool_responses(kept_tail));

    let tokens_after = estimate_history_tokens(&rebuilt);
    debug!(
        tokens_before,
        tokens_after,
        compressed = split,
        "context window compressed"
    );
    (
        rebuilt,
        Some(CompressionStats {
            tokens_before,
            tokens_after,
            compressed_messages: split,
        }),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
