// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use synapse_config::{EntityConfig, ExecutorConfig};
use synapse_model::{Message, ModelProvider};
use synapse_tools::ToolRegistry;

use crate::context::Summarizer;
use crate::error::{build_error_response, ErrorFormatter, ExecutorError};
use crate::executor::{AgentExecutor, FinalResponse};
use crate::log::{EventKind, EventSink, LogEvent, NullSink};
use crate::memory::{MemoryRecorder, NullRecorder};
use crate::plan::Plan;
use crate::progress::{ProgressBus, ProgressEvent};
use crate::request::{CancelHandle, PathwayResultData, Request, RequestState};

/// Everything a finished request yields, error paths included.
#[derive(Debug)]
pub struct FinalOutcome {
    pub request_id: String,
    /// User-facing text: the assistant's answer, or the formatted error
    /// message on failure.
    pub text: String,
    pub error: Option<String>,
    pub result_data: PathwayResultData,
    pub history: Vec<Message>,
    pub budget_used: u32,
    pub rounds: u32,
    pub replan_count: u32,
    pub gate_retries: u32,
    pub plan: Option<Plan>,
}

/// Owns request lifecycles: per-request state, cancellation, progress
/// publishing, and the terminal-event guarantee.
///
/// Concurrent requests never share mutable state: each gets its own
/// [`RequestState`] and task; the bus, registry and sinks are the only
/// shared resources.
pub struct RequestCoordinator {
    config: Arc<ExecutorConfig>,
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    registry: Arc<ToolRegistry>,
    entities: HashMap<String, EntityConfig>,
    bus: Arc<ProgressBus>,
    sink: Arc<dyn EventSink>,
    memory: Arc<dyn MemoryRecorder>,
    summarizer: Option<Arc<dyn Summarizer>>,
    error_formatter: Option<Arc<dyn ErrorFormatter>>,
    active: Mutex<HashMap<String, CancelHandle>>,
}

impl RequestCoordinator {
    pub fn new(config: ExecutorConfig, registry: ToolRegistry) -> Self {
        Self {
            config: Arc::new(config),
            providers: HashMap::new(),
            registry: Arc::new(registry),
            entities: HashMap::new(),
            bus: Arc::new(ProgressBus::new()),
            sink: Arc::new(NullSink),
            memory: Arc::new(NullRecorder),
            summarizer: None,
            error_formatter: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register a model endpoint under the key the executor config refers
    /// to (`primary_model` / `tool_loop_model`).
    pub fn with_provider(
        mut self,
        key: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Self {
        self.providers.insert(key.into(), provider);
        self
    }

    pub fn with_entity(mut self, entity: EntityConfig) -> Self {
        self.entities.insert(entity.id.clone(), entity);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryRecorder>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_error_formatter(mut self, formatter: Arc<dyn ErrorFormatter>) -> Self {
        self.error_formatter = Some(formatter);
        self
    }

    /// Subscribe to a request's progress events before (or while) it runs.
    pub fn subscribe(
        &self,
        request_id: &str,
    ) -> tokio::sync::mpsc::UnboundedReceiver<ProgressEvent> {
        self.bus.subscribe(request_id)
    }

    /// Mark a request canceled.  In-flight tool calls complete, but no
    /// further model calls or tool rounds are initiated.
    pub fn cancel(&self, request_id: &str) {
        if let Some(handle) = self.active.lock().unwrap().get(request_id) {
            debug!(rid = %request_id, "request canceled");
            handle.cancel();
        }
    }

    /// Accept a request and run it asynchronously; progress streams to
    /// subscribers.  Returns the request id immediately.
    pub fn submit(self: &Arc<Self>, request: Request) -> String {
        let id = request.id.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.run(request).await;
        });
        id
    }

    /// Run a request to completion and return the final result directly.
    /// Every path (success, failure, cancellation) publishes exactly one
    /// terminal progress event for a root request.
    pub async fn run(&self, request: Request) -> FinalOutcome {
        let mut state = RequestState::new();
        self.active
            .lock()
            .unwrap()
            .insert(request.id.clone(), state.cancel_handle());

        self.sink.emit(
            LogEvent::new(&request.id, EventKind::RequestStart)
                .field("entity", request.entity_id.clone())
                .field(
                    "invocation",
                    serde_json::to_value(request.invocation).unwrap_or_default(),
                )
                .field("stream", request.stream),
        );
        if request.callback_depth > 0 {
            self.sink.emit(
                LogEvent::new(&request.id, EventKind::CallbackEntry)
                    .field("depth", request.callback_depth)
                    .field("root", request.progress_id().to_string()),
            );
        }

        let result = self.run_inner(&request, &mut state).await;
        self.active.lock().unwrap().remove(&request.id);

        match result {
            Ok(response) => self.finish_ok(&request, state, response),
            Err(ExecutorError::Canceled) => {
                if request.is_root() && !state.completion_sent {
                    self.bus.publish(
                        ProgressEvent::terminal(&request.id, "").with_error("Request canceled"),
                    );
                }
                self.sink.emit(
                    LogEvent::new(&request.id, EventKind::RequestError)
                        .field("error", "Request canceled"),
                );
                FinalOutcome {
                    request_id: request.id.clone(),
                    text: String::new(),
                    error: Some("Request canceled".into()),
                    result_data: state.result_data.clone(),
                    history: Vec::new(),
                    budget_used: state.budget,
                    rounds: state.round,
                    replan_count: state.replan_count,
                    gate_retries: state.gate_retries,
                    plan: state.plan.clone(),
                }
            }
            Err(e) => {
                let text =
                    build_error_response(self.error_formatter.as_deref(), &e).await;
                if request.is_root() && !state.completion_sent {
                    let info =
                        serde_json::to_string(&state.result_data).unwrap_or_default();
                    self.bus.publish(
                        ProgressEvent::terminal(&request.id, text.clone())
                            .with_info(info)
                            .with_error(e.to_string()),
                    );
                }
                self.sink.emit(
                    LogEvent::new(&request.id, EventKind::RequestError)
                        .field("error", e.to_string()),
                );
                FinalOutcome {
                    request_id: request.id.clone(),
                    text,
                    error: Some(e.to_string()),
                    result_data: state.result_data.clone(),
                    history: Vec::new(),
                    budget_used: state.budget,
                    rounds: state.round,
                    replan_count: state.replan_count,
                    gate_retries: state.gate_retries,
                    plan: state.plan.clone(),
                }
            }
        }
    }

    fn finish_ok(
        &self,
        request: &Request,
        state: RequestState,
        response: FinalResponse,
    ) -> FinalOutcome {
        if request.is_root() && !state.completion_sent {
            let info = serde_json::to_string(&state.result_data).unwrap_or_default();
            self.bus.publish(
                ProgressEvent::terminal(&request.id, response.text.clone()).with_info(info),
            );
        }
        self.sink.emit(
            LogEvent::new(&request.id, EventKind::RequestEnd)
                .field("budget_used", state.budget)
                .field("rounds", state.round)
                .field("replan_count", state.replan_count),
        );
        FinalOutcome {
            request_id: request.id.clone(),
            text: response.text,
            error: None,
            result_data: state.result_data.clone(),
            history: response.history,
            budget_used: state.budget,
            rounds: state.round,
            replan_count: state.replan_count,
            gate_retries: state.gate_retries,
            plan: state.plan,
        }
    }

    async fn run_inner(
        &self,
        request: &Request,
        state: &mut RequestState,
    ) -> Result<FinalResponse, ExecutorError> {
        let entity = self
            .entities
            .get(&request.entity_id)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownEntity(request.entity_id.clone()))?;
        let primary = self
            .providers
            .get(&self.config.primary_model)
            .cloned()
            .ok_or_else(|| {
                ExecutorError::ModelCall(format!(
                    "no provider configured for endpoint '{}'",
                    self.config.primary_model
                ))
            })?;
        let tool_loop = match &self.config.tool_loop_model {
            Some(key) => Some(self.providers.get(key).cloned().ok_or_else(|| {
                ExecutorError::ModelCall(format!(
                    "no provider configured for endpoint '{key}'"
                ))
            })?),
            None => None,
        };
        let tools = self.registry.tools_for_entity(&entity, request.invocation);

        let executor = AgentExecutor::new(
            primary,
            tool_loop,
            entity,
            tools,
            Arc::clone(&self.config),
            Arc::clone(&self.bus),
            Arc::clone(&self.sink),
            self.summarizer.clone(),
            Arc::clone(&self.memory),
        );
        executor.execute(request, state).await
    }
}
