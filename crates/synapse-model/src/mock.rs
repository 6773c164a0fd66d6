// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ResponseStream, CompletionRequest, ModelResponse, ResponseEvent, StreamChunk,
    ToolCallRecord,
};

/// A pre-scripted mock provider.  Each call pops the next response from the
/// front of the queue, so tests can specify exact turn sequences (including
/// parallel tool calls) without network access.
///
/// Every request (streaming or not) is recorded into `requests` so tests can
/// inspect what the executor actually sent.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<ModelResponse>>>,
    name: String,
    max_prompt_tokens: usize,
    /// Every `CompletionRequest` seen by this provider, in call order.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from an ordered list of responses.
    pub fn new(scripts: Vec<ModelResponse>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            max_prompt_tokens: synapse_config::constants::DEFAULT_MODEL_CONTEXT_LIMIT,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shrink the claimed prompt window so window-compression paths trigger
    /// without megabytes of fixture text.
    pub fn with_max_prompt_tokens(mut self, max: usize) -> Self {
        self.max_prompt_tokens = max;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ModelResponse {
            content: reply.into(),
            ..Default::default()
        }])
    }

    /// Convenience: a text-only response script entry.
    pub fn text(reply: impl Into<String>) -> ModelResponse {
        ModelResponse { content: reply.into(), ..Default::default() }
    }

    /// Convenience: a response script entry carrying tool calls.
    pub fn calls(tool_calls: Vec<ToolCallRecord>) -> ModelResponse {
        ModelResponse { tool_calls, ..Default::default() }
    }

    fn next_response(&self, req: CompletionRequest) -> ModelResponse {
        self.requests.lock().unwrap().push(req);
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Default fallback when all scripts are consumed
            ModelResponse { content: "[no more scripts]".into(), ..Default::default() }
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_prompt_tokens(&self) -> usize {
        self.max_prompt_tokens
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ModelResponse> {
        Ok(self.next_response(req))
    }

    async fn complete_streaming(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let resp = self.next_response(req);
        let mut events: Vec<anyhow::Result<StreamChunk>> = Vec::new();
        if !resp.content.is_empty() {
            events.push(Ok(StreamChunk::event(ResponseEvent::TextDelta(
                resp.content.clone(),
            ))));
        }
        for (i, tc) in resp.tool_calls.iter().enumerate() {
            events.push(Ok(StreamChunk::event(ResponseEvent::ToolCallDelta {
                index: i as u32,
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
                thought_signature: tc.thought_signature.clone(),
            })));
        }
        if let Some(u) = resp.usage {
            events.push(Ok(StreamChunk::event(ResponseEvent::Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })));
        }
        events.push(Ok(StreamChunk::event(ResponseEvent::Done)));
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
