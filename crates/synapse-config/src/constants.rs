// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Fixed operating limits for the agent executor.
//!
//! These values are wire-compatible with the serving layer's accounting and
//! must not be tuned per deployment; deployment-level knobs live in
//! [`crate::ExecutorConfig`].

use std::time::Duration;

/// Hard cap on accumulated tool cost within a single request.
pub const TOOL_BUDGET: u32 = 500;

/// Cost charged for a tool that does not declare its own.
pub const DEFAULT_TOOL_COST: u32 = 10;

/// Per-invocation deadline for a tool that does not declare its own.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Tool results longer than this are truncated before entering history.
pub const MAX_TOOL_RESULT_LENGTH: usize = 150_000;

/// Fraction of the model's prompt window at which context-window
/// summarization kicks in.
pub const CONTEXT_COMPRESSION_THRESHOLD: f64 = 0.7;

/// Prompt-token ceiling assumed for models that do not report one.
pub const DEFAULT_MODEL_CONTEXT_LIMIT: usize = 128_000;

/// Planning-gate re-prompts before tool calls are discarded.
pub const MAX_GATE_RETRIES: u32 = 2;

/// Replans accepted at synthesis time before the response is returned as-is.
pub const MAX_REPLAN_SAFETY_CAP: u32 = 10;

/// Tool-response character count above which the full content is captured
/// into the result store for later compression.
pub const COMPRESSION_THRESHOLD: usize = 4000;

/// Maximum assistant/tool-response pairs exported as request result data.
pub const MAX_DEHYDRATED_PAIRS: usize = 10;

/// A model stream that delivers no data for this long is destroyed and the
/// request terminated with an error.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for the external context-summarization call.
pub const SUMMARIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// Flat token estimate charged per image content part.
pub const IMAGE_TOKEN_ESTIMATE: usize = 85;

/// Per-message overhead tokens in the context estimate.
pub const MESSAGE_TOKEN_OVERHEAD: usize = 4;

/// Per-tool-call overhead tokens in the context estimate.
pub const TOOL_CALL_TOKEN_OVERHEAD: usize = 10;

/// Conversation turns kept when slicing inbound history.
pub const DEFAULT_TURN_WINDOW: usize = 10;

/// Messages preserved verbatim at the tail during window compression.
pub const COMPRESSION_KEEP_RECENT: usize = 6;
