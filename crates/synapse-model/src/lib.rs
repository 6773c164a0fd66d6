// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use mock::ScriptedMockProvider;
pub use openai_compat::OpenAICompatProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    normalize_tool_calls, CompletionRequest, ContentPart, Message, MessageContent, ModelResponse,
    ResponseEvent, Role, StreamChunk, ToolCallRecord, ToolChoice, ToolSchema, Usage,
};
