// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming pipeline: consumes a model plugin's event stream, accumulates
//! text and tool-call deltas, fans raw events out to progress subscribers,
//! and upholds the completion guarantees.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::json;
use tracing::warn;

use synapse_config::constants::STREAM_IDLE_TIMEOUT;
use synapse_model::{ResponseEvent, ResponseStream, ToolCallRecord, Usage};

use crate::error::ExecutorError;
use crate::progress::{ProgressBus, ProgressEvent};
use crate::request::{Request, RequestState};

/// Everything a drained stream produced.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Option<Usage>,
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
    thought_signature: Option<String>,
}

impl PendingToolCall {
    fn finish(self) -> ToolCallRecord {
        // The dispatcher needs a JSON object to parse; an empty buffer means
        // the model sent a call with no arguments at all.
        let arguments = if self.args_buf.is_empty() {
            "{}".to_string()
        } else {
            self.args_buf
        };
        ToolCallRecord {
            id: self.id,
            name: self.name,
            arguments,
            thought_signature: self.thought_signature,
        }
    }
}

/// Drain a streaming model response.
///
/// Text deltas accumulate into the request's streamed-content buffer and fan
/// out to subscribers as non-terminal progress carrying the raw event JSON.
/// Tool-call deltas accumulate by parallel index.  Five minutes without any
/// data destroys the stream with a [`ExecutorError::Stream`].
///
/// If the underlying stream closes without a `Done` event: a stream that
/// surfaced tool calls is left to the executor (it owns the lifecycle from
/// here); a stream that delivered data but no completion, no tool calls and
/// no error gets a warning and an empty terminal event so the subscriber is
/// never left hanging.
pub async fn drain_stream(
    mut stream: ResponseStream,
    request: &Request,
    state: &mut RequestState,
    bus: &ProgressBus,
) -> Result<StreamOutcome, ExecutorError> {
    let mut text = String::new();
    let mut usage: Option<Usage> = None;
    let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
    let mut stream_error: Option<String> = None;
    let mut got_data = false;
    let mut done = false;

    loop {
        if state.is_canceled() {
            return Err(ExecutorError::Canceled);
        }
        let next = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Ok(n) => n,
            Err(_) => {
                return Err(ExecutorError::Stream(format!(
                    "no stream data received for {}s",
                    STREAM_IDLE_TIMEOUT.as_secs()
                )));
            }
        };
        let chunk = match next {
            None => break,
            Some(Err(e)) => return Err(ExecutorError::Stream(e.to_string())),
            Some(Ok(c)) => c,
        };
        got_data = true;

        match chunk.event {
            ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                text.push_str(&delta);
                state.streamed_content.push_str(&delta);
                let data = chunk
                    .raw
                    .unwrap_or_else(|| json!({ "delta": delta }).to_string());
                bus.publish(ProgressEvent::partial(request.progress_id(), 0.5, data));
            }
            ResponseEvent::TextDelta(_) => {}
            ResponseEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
                thought_signature,
            } => {
                let ptc = pending.entry(index).or_insert_with(|| PendingToolCall {
                    id: String::new(),
                    name: String::new(),
                    args_buf: String::new(),
                    thought_signature: None,
                });
                if !id.is_empty() {
                    ptc.id = id;
                }
                if !name.is_empty() {
                    ptc.name = name;
                }
                if thought_signature.is_some() {
                    ptc.thought_signature = thought_signature;
                }
                ptc.args_buf.push_str(&arguments);
                if let Some(raw) = chunk.raw {
                    bus.publish(ProgressEvent::partial(request.progress_id(), 0.5, raw));
                }
            }
            ResponseEvent::Usage { input_tokens, output_tokens } => {
                usage = Some(Usage { input_tokens, output_tokens });
            }
            ResponseEvent::Error(msg) => {
                warn!(rid = %request.id, "model stream error event: {msg}");
                let data = chunk.raw.unwrap_or_else(|| json!({ "error": msg }).to_string());
                bus.publish(
                    ProgressEvent::partial(request.progress_id(), 0.5, data)
                        .with_error(msg.clone()),
                );
                stream_error = Some(msg);
            }
            ResponseEvent::Done => {
                done = true;
                break;
            }
        }
    }

    // Flush accumulated parallel tool calls, ordered by index.  Calls with
    // an empty name cannot be dispatched and are dropped; an empty id gets a
    // synthetic fallback so the pairing invariant still holds.
    let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    pending_sorted.sort_by_key(|(idx, _)| *idx);
    let mut tool_calls = Vec::with_capacity(pending_sorted.len());
    for (i, (_, ptc)) in pending_sorted.into_iter().enumerate() {
        if ptc.name.is_empty() {
            warn!(tool_call_id = %ptc.id, "dropping streamed tool call with empty name");
            continue;
        }
        let mut tc = ptc.finish();
        if tc.id.is_empty() {
            tc.id = format!("tc_synthetic_{i}");
            warn!(tool_name = %tc.name, "streamed tool call had empty id; generated synthetic id");
        }
        tool_calls.push(tc);
    }

    // A stream that surfaced tool calls hands the lifecycle to the executor;
    // a missing terminal is expected there.  Otherwise a close without `Done`
    // must not leave the subscriber hanging.
    if !done && tool_calls.is_empty() {
        if let Some(msg) = stream_error {
            return Err(ExecutorError::Stream(msg));
        }
        if got_data {
            warn!(
                rid = %request.id,
                "stream closed without completion; publishing empty terminal event"
            );
            if request.is_root() {
                bus.publish(ProgressEvent::terminal(request.progress_id(), ""));
                state.completion_sent = true;
            }
            return Ok(StreamOutcome { text, tool_calls, usage });
        }
    }

    if stream_error.is_some() && text.is_empty() && tool_calls.is_empty() {
        return Err(ExecutorError::Stream(stream_error.unwrap_or_default()));
    }

    Ok(StreamOutcome { text, tool_calls, usage })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
