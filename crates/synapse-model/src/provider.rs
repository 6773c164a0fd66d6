// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, ModelResponse, StreamChunk};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// The observable contract of an LLM wire plugin.
///
/// The executor loop always calls [`complete`] (non-streaming); only the
/// initial call and the final synthesis use [`complete_streaming`], and only
/// when the client asked for a stream.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable plugin name for logs and status display.
    fn name(&self) -> &str;

    /// Prompt-token ceiling used for context-window decisions.
    fn max_prompt_tokens(&self) -> usize {
        synapse_config::constants::DEFAULT_MODEL_CONTEXT_LIMIT
    }

    /// Send a completion request and wait for the full result.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ModelResponse>;

    /// Send a completion request and return a streaming handle.
    async fn complete_streaming(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}
