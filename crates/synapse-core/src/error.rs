// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// Everything that can go wrong while driving one request.
///
/// Tool-level failures never surface here: the dispatcher captures them as
/// tool-response messages so the loop can route around them.  The variants
/// below are the request-level outcomes the coordinator matches on.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("model call failed: {0}")]
    ModelCall(String),
    #[error("{tool} failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },
    #[error("context compression failed: {0}")]
    ContextCompression(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("invalid tool call: {0}")]
    InvalidToolCall(String),
    #[error("planning gate exhausted after {0} retries")]
    PlanningGateExhausted(u32),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("Request canceled")]
    Canceled,
    #[error("I processed your request but wasn't able to generate a response.")]
    EmptyResponse,
}

/// External error-formatting pathway: turns an executor error into the
/// user-facing apology text.
#[async_trait]
pub trait ErrorFormatter: Send + Sync {
    async fn format(&self, error: &ExecutorError) -> anyhow::Result<String>;
}

/// Fixed fallback used when the error pathway itself fails (or none is
/// configured).
pub fn fallback_error_text(error: &ExecutorError) -> String {
    format!(
        "I apologize, but I encountered an error while processing your request: {error}. \
         Please try again or contact support if the issue persists."
    )
}

/// Build the user-facing error message, falling back to the canned text when
/// the external pathway fails.
pub async fn build_error_response(
    formatter: Option<&dyn ErrorFormatter>,
    error: &ExecutorError,
) -> String {
    if let Some(f) = formatter {
        match f.format(error).await {
            Ok(text) if !text.is_empty() => return text,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("error formatting pathway failed: {e}");
            }
        }
    }
    fallback_error_text(error)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
