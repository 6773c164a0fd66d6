// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod context;
mod coordinator;
mod dispatcher;
mod error;
mod executor;
mod log;
mod memory;
mod plan;
mod progress;
mod request;
mod stream;

pub use context::{
    compress_context_window, default_summarize, dehydrate_round, dehydrate_tool_history,
    filter_orphan_tool_responses, normalize_history, rehydrate, slice_by_turns, Summarizer,
};
pub use coordinator::{FinalOutcome, RequestCoordinator};
pub use dispatcher::{dispatch_round, RoundOutcome, RoundStats};
pub use error::{build_error_response, fallback_error_text, ErrorFormatter, ExecutorError};
pub use executor::{AgentExecutor, FinalResponse};
pub use log::{EventKind, EventSink, LogEvent, NdjsonSink, NullSink};
pub use memory::{MemoryKind, MemoryRecorder, NullRecorder};
pub use plan::{passes_gate, plan_tool_schema, Plan, PLAN_TOOL_NAME};
pub use progress::{ProgressBus, ProgressEvent};
pub use request::{CancelHandle, PathwayResultData, Request, RequestState, ToolResultStoreEntry};
pub use stream::{drain_stream, StreamOutcome};
