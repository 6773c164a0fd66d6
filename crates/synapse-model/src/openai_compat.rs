// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Every hosted or local endpoint that speaks the `/chat/completions` wire
//! format is served by this one driver configured with its endpoint URL and
//! auth.  Both call shapes of the plugin contract are provided: a blocking
//! JSON response and an SSE stream whose events are forwarded with their raw
//! payload attached.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, CompletionRequest, Message, MessageContent, ModelResponse,
    ResponseEvent, Role, StreamChunk, ToolCallRecord, ToolChoice, Usage,
};

pub struct OpenAICompatProvider {
    /// Plugin id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).  `None` for local servers.
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_prompt_tokens: usize,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    /// `base_url` ends **before** `/chat/completions`, e.g.
    /// `https://api.openai.com/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_prompt_tokens: Option<usize>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_prompt_tokens: max_prompt_tokens
                .unwrap_or(synapse_config::constants::DEFAULT_MODEL_CONTEXT_LIMIT),
            client: reqwest::Client::new(),
        }
    }

    /// Build a provider from a configured endpoint (API key resolved from
    /// the config value or its named environment variable).
    pub fn from_endpoint(cfg: &synapse_config::EndpointConfig) -> Self {
        Self::new(
            "openai-compat",
            cfg.model.clone(),
            cfg.resolve_api_key(),
            &cfg.base_url,
            cfg.max_prompt_tokens,
        )
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let model = req.model_override.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": build_wire_messages(&req.messages),
            "stream": req.stream,
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!(match req.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::None => "none",
                ToolChoice::Required => "required",
            });
        }
        if let Some(effort) = req.reasoning_effort {
            body["reasoning_effort"] = serde_json::to_value(effort).unwrap_or(Value::Null);
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        debug!(
            driver = %self.driver_name,
            model = %self.model,
            message_count = body["messages"].as_array().map(|a| a.len()).unwrap_or(0),
            "sending completion request"
        );
        let mut http_req = self.client.post(&self.chat_url).json(body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }
        Ok(resp)
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn max_prompt_tokens(&self) -> usize {
        self.max_prompt_tokens
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ModelResponse> {
        let mut req = req;
        req.stream = false;
        let body = self.build_body(&req);
        let resp = self.send(&body).await?;
        let v: Value = resp
            .json()
            .await
            .with_context(|| format!("{} returned unparseable JSON", self.driver_name))?;
        parse_completion_body(&v)
    }

    async fn complete_streaming(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut req = req;
        req.stream = true;
        let body = self.build_body(&req);
        let resp = self.send(&body).await?;

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<StreamChunk>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Wire serialization ───────────────────────────────────────────────────────

fn role_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize the conversation into OpenAI wire messages.
///
/// Assistant tool calls become the nested `{type, function}` array; a
/// carried `thought_signature` is echoed back on the same element.
fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = json!({ "role": role_str(m.role) });
            obj["content"] = match &m.content {
                MessageContent::Text(t) => json!(t),
                MessageContent::Parts(parts) => json!(parts
                    .iter()
                    .map(|p| match p {
                        crate::ContentPart::Text { text } =>
                            json!({ "type": "text", "text": text }),
                        crate::ContentPart::Image { image_url } =>
                            json!({ "type": "image_url", "image_url": { "url": image_url } }),
                    })
                    .collect::<Vec<_>>()),
            };
            if !m.tool_calls.is_empty() {
                obj["tool_calls"] = json!(m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        let mut call = json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments },
                        });
                        if let Some(sig) = &tc.thought_signature {
                            call["thoughtSignature"] = json!(sig);
                        }
                        call
                    })
                    .collect::<Vec<_>>());
            }
            if let Some(id) = &m.tool_call_id {
                obj["tool_call_id"] = json!(id);
            }
            if let Some(name) = &m.name {
                obj["name"] = json!(name);
            }
            obj
        })
        .collect()
}

// ─── Response parsing ─────────────────────────────────────────────────────────

fn parse_completion_body(v: &Value) -> anyhow::Result<ModelResponse> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        bail!("completion response carried no message: {v}");
    }
    let content = message["content"].as_str().unwrap_or_default().to_string();
    let tool_calls = message
        .get("tool_calls")
        .map(crate::normalize_tool_calls)
        .unwrap_or_default();
    let usage = v.get("usage").filter(|u| !u.is_null()).map(|u| Usage {
        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
    });
    let finish_reason = v["choices"][0]["finish_reason"].as_str().map(str::to_string);
    Ok(ModelResponse { content, tool_calls, usage, finish_reason })
}

/// Parse a single complete SSE `data:` line into a [`StreamChunk`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<StreamChunk>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamChunk::event(ResponseEvent::Done)));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    let event = parse_sse_chunk(&v)?;
    Some(Ok(StreamChunk { event, raw: Some(data.to_string()) }))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<StreamChunk>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        // Advance buffer past the consumed line including the \n.
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> Option<ResponseEvent> {
    // Event-level error payload ({"error": {...}} or {"error": "..."}).
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        let msg = err["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Some(ResponseEvent::Error(msg));
    }

    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta: each SSE chunk carries one tool-call fragment in
    // practice; the index routes accumulation for parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(ResponseEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            thought_signature: tc["thoughtSignature"].as_str().map(str::to_string),
        });
    }

    delta["content"]
        .as_str()
        .map(|t| ResponseEvent::TextDelta(t.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolSchema;

    #[test]
    fn wire_messages_include_tool_calls_and_responses() {
        let messages = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCallRecord::new("c1", "Weather", "{\"city\":\"Paris\"}")],
            ),
            Message::tool_response("c1", "Weather", "Sunny, 15°C"),
        ];
        let wire = build_wire_messages(&messages);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "Weather");
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "c1");
        assert_eq!(wire[1]["name"], "Weather");
    }

    #[test]
    fn wire_messages_echo_thought_signature() {
        let mut tc = ToolCallRecord::new("c1", "f", "{}");
        tc.thought_signature = Some("sig".into());
        let wire = build_wire_messages(&[Message::assistant_with_tool_calls("", vec![tc])]);
        assert_eq!(wire[0]["tool_calls"][0]["thoughtSignature"], "sig");
    }

    #[test]
    fn build_body_carries_tools_and_effort() {
        let p = OpenAICompatProvider::new("test", "m1".into(), None, "http://x/v1", None);
        let req = CompletionRequest {
            messages: vec![Message::user("q")],
            tools: vec![ToolSchema {
                name: "Weather".into(),
                description: "d".into(),
                parameters: json!({"type": "object"}),
            }],
            tool_choice: ToolChoice::Auto,
            stream: false,
            reasoning_effort: Some(synapse_config::ReasoningEffort::Low),
            model_override: None,
        };
        let body = p.build_body(&req);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["tools"][0]["function"]["name"], "Weather");
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn build_body_model_override_wins() {
        let p = OpenAICompatProvider::new("test", "m1".into(), None, "http://x/v1", None);
        let req = CompletionRequest {
            messages: vec![Message::user("q")],
            model_override: Some("m2".into()),
            ..Default::default()
        };
        assert_eq!(p.build_body(&req)["model"], "m2");
    }

    #[test]
    fn parse_completion_body_full_shape() {
        let v = json!({
            "choices": [{
                "message": {
                    "content": "hello",
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "f", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let r = parse_completion_body(&v).unwrap();
        assert_eq!(r.content, "hello");
        assert_eq!(r.tool_calls.len(), 1);
        assert_eq!(r.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(r.usage.unwrap().input_tokens, 12);
    }

    #[test]
    fn parse_completion_body_without_message_errors() {
        assert!(parse_completion_body(&json!({"choices": []})).is_err());
    }

    #[test]
    fn sse_lines_split_across_chunks() {
        let mut buf = String::new();
        buf.push_str("data: {\"choices\":[{\"delta\":{\"con");
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        buf.push_str("tent\":\"hi\"}}]}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        let chunk = events[0].as_ref().unwrap();
        assert!(matches!(&chunk.event, ResponseEvent::TextDelta(t) if t == "hi"));
        assert!(chunk.raw.is_some());
    }

    #[test]
    fn sse_done_sentinel_parses() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(
            events[0].as_ref().unwrap().event,
            ResponseEvent::Done
        ));
    }

    #[test]
    fn sse_tool_call_delta_parses() {
        let v = json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 1,
                "id": "c9",
                "function": {"name": "Search", "arguments": "{\"q\":"}
            }]}}]
        });
        match parse_sse_chunk(&v).unwrap() {
            ResponseEvent::ToolCallDelta { index, id, name, arguments, .. } => {
                assert_eq!(index, 1);
                assert_eq!(id, "c9");
                assert_eq!(name, "Search");
                assert_eq!(arguments, "{\"q\":");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn sse_error_event_parses() {
        let v = json!({"error": {"message": "overloaded"}});
        assert!(matches!(
            parse_sse_chunk(&v).unwrap(),
            ResponseEvent::Error(m) if m == "overloaded"
        ));
    }

    #[test]
    fn sse_usage_chunk_parses() {
        let v = json!({"usage": {"prompt_tokens": 7, "completion_tokens": 2}, "choices": []});
        assert!(matches!(
            parse_sse_chunk(&v).unwrap(),
            ResponseEvent::Usage { input_tokens: 7, output_tokens: 2 }
        ));
    }
}
