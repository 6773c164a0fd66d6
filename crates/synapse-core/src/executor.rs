// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::{debug, warn};

use synapse_config::constants::{MAX_GATE_RETRIES, MAX_REPLAN_SAFETY_CAP};
use synapse_config::{EntityConfig, ExecutorConfig, InvocationType, ReasoningEffort};
use synapse_model::{
    CompletionRequest, Message, ModelProvider, Role, ToolCallRecord, ToolChoice, ToolSchema, Usage,
};
use synapse_tools::EntityTools;

use crate::context::{
    compress_context_window, compress_older_tool_results, dehydrate_round, dehydrate_tool_history,
    rehydrate, slice_by_turns, Summarizer,
};
use crate::dispatcher::dispatch_round;
use crate::error::ExecutorError;
use crate::log::{EventKind, EventSink, LogEvent};
use crate::memory::{MemoryKind, MemoryRecorder};
use crate::plan::{
    gate_admonishment, gate_applies, is_plan_call, loop_instruction, parse_plan, passes_gate,
    plan_tool_schema, replan_instruction, strip_loop_instructions, strip_plan_messages,
};
use crate::progress::ProgressBus;
use crate::request::{Request, RequestState};
use crate::stream::drain_stream;

/// The final product of a request: the assistant text plus the full history
/// it was produced from.
#[derive(Debug)]
pub struct FinalResponse {
    pub text: String,
    pub history: Vec<Message>,
}

/// Drives one request through the dual-model tool loop: initial call,
/// planning gate, executor loop, synthesis, and the replan re-entry.  Falls
/// back to a single-model loop when no executor model is configured.
pub struct AgentExecutor {
    primary: Arc<dyn ModelProvider>,
    tool_loop: Option<Arc<dyn ModelProvider>>,
    entity: EntityConfig,
    tools: EntityTools,
    config: Arc<ExecutorConfig>,
    bus: Arc<ProgressBus>,
    sink: Arc<dyn EventSink>,
    summarizer: Option<Arc<dyn Summarizer>>,
    memory: Arc<dyn MemoryRecorder>,
}

impl AgentExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        primary: Arc<dyn ModelProvider>,
        tool_loop: Option<Arc<dyn ModelProvider>>,
        entity: EntityConfig,
        tools: EntityTools,
        config: Arc<ExecutorConfig>,
        bus: Arc<ProgressBus>,
        sink: Arc<dyn EventSink>,
        summarizer: Option<Arc<dyn Summarizer>>,
        memory: Arc<dyn MemoryRecorder>,
    ) -> Self {
        Self {
            primary,
            tool_loop,
            entity,
            tools,
            config,
            bus,
            sink,
            summarizer,
            memory,
        }
    }

    /// Run the request to its final assistant message.
    pub async fn execute(
        &self,
        request: &Request,
        state: &mut RequestState,
    ) -> Result<FinalResponse, ExecutorError> {
        let mut history: Vec<Message> = Vec::new();
        if let Some(instructions) = &self.entity.instructions {
            history.push(Message::system(instructions));
        }
        history.extend(slice_by_turns(&request.history, self.config.turn_window));
        history.push(Message::user(&request.message));

        // 1. Initial call on the primary model, streaming honored, full tool
        //    surface plus the plan tool.
        let (text, tool_calls, _) = self
            .call_model(
                &self.primary,
                request,
                state,
                history.clone(),
                self.entity_schemas(true),
                request.stream,
                self.config.reasoning_effort,
                "initial",
            )
            .await?;

        // 2. A plain text response is the final answer.
        if tool_calls.is_empty() {
            return self.finish(request, state, history, text).await;
        }

        if self.tool_loop.is_none() {
            return self
                .run_fallback(request, state, history, text, tool_calls)
                .await;
        }

        // 3. Planning gate, then the executor loop proper.
        let (text, tool_calls, loop_tools_enabled) = self
            .apply_gate(request, state, &mut history, text, tool_calls)
            .await?;
        if tool_calls.is_empty() && !loop_tools_enabled {
            // Gate exhausted and nothing runnable: the executor loop runs
            // tool-less and will hand straight over to synthesis.
            debug!(rid = %request.id, "entering executor loop with tools disabled");
        } else if tool_calls.is_empty() {
            // Gate retry answered in text only; treat as final.
            return self.finish(request, state, history, text).await;
        }

        self.run_dual(
            request,
            state,
            history,
            text,
            tool_calls,
            loop_tools_enabled,
        )
        .await
    }

    /// Planning gate: a tool-calling turn must include `SetGoals`.  Re-prompts the
    /// primary up to [`MAX_GATE_RETRIES`] times; on exhaustion the calls are
    /// discarded and the loop proceeds with tools disabled.
    ///
    /// Returns `(text, tool_calls, loop_tools_enabled)`.
    async fn apply_gate(
        &self,
        request: &Request,
        state: &mut RequestState,
        history: &mut Vec<Message>,
        text: String,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<(String, Vec<ToolCallRecord>, bool), ExecutorError> {
        if !gate_applies(request.invocation, request.callback_depth) {
            let reason = if request.invocation == InvocationType::Pulse {
                "pulse"
            } else {
                "nested callback"
            };
            self.sink.emit(
                LogEvent::new(&request.id, EventKind::PlanSkipped).field("reason", reason),
            );
            return Ok((text, tool_calls, true));
        }

        let mut text = text;
        let mut tool_calls = tool_calls;
        while !passes_gate(&tool_calls) {
            if state.gate_retries >= MAX_GATE_RETRIES {
                warn!(rid = %request.id, "planning gate exhausted; discarding tool calls");
                self.sink.emit(
                    LogEvent::new(&request.id, EventKind::PlanSkipped)
                        .field("reason", "gate retries exhausted"),
                );
                return Ok((text, Vec::new(), false));
            }
            state.gate_retries += 1;
            history.push(gate_admonishment(&request.id));
            let (t, tc, _) = self
                .call_model(
                    &self.primary,
                    request,
                    state,
                    history.clone(),
                    self.entity_schemas(true),
                    false,
                    self.config.reasoning_effort,
                    "gate-retry",
                )
                .await?;
            if tc.is_empty() {
                // The model gave up on tools entirely; its text stands.
                return Ok((t, Vec::new(), true));
            }
            text = t;
            tool_calls = tc;
        }
        Ok((text, tool_calls, true))
    }

    /// The dual-model pipeline: seed round, executor loop on the cheap
    /// model, synthesis on the primary, replan/continuation re-entry.
    async fn run_dual(
        &self,
        request: &Request,
        state: &mut RequestState,
        mut history: Vec<Message>,
        text: String,
        tool_calls: Vec<ToolCallRecord>,
        loop_tools_enabled: bool,
    ) -> Result<FinalResponse, ExecutorError> {
        let executor_model = self
            .tool_loop
            .clone()
            .expect("run_dual requires a tool loop model");
        let loop_schemas = if loop_tools_enabled {
            self.entity_schemas(false)
        } else {
            Vec::new()
        };

        let mut seed = if tool_calls.is_empty() {
            None
        } else {
            Some((text, tool_calls))
        };
        // One-shot skip of the executor loop after a continuation round or a
        // pulse-terminating tool.
        let mut skip_loop = false;

        loop {
            // 4. Execute the pending tool round.
            if let Some((seed_text, seed_calls)) = seed.take() {
                if state.is_canceled() {
                    return Err(ExecutorError::Canceled);
                }
                if !state.budget_exhausted() {
                    let outcome = dispatch_round(
                        seed_text,
                        seed_calls,
                        request,
                        state,
                        &self.tools,
                        &self.bus,
                        self.sink.as_ref(),
                    )
                    .await;
                    history.extend(outcome.messages);
                    self.post_round(request, state, &mut history).await;
                    if outcome.pulse_ended {
                        skip_loop = true;
                    }
                }
            }

            // 5. The executor model never sees the plan tool traffic.
            strip_plan_messages(&mut history);

            // 6. Executor loop: cheap model, non-streaming, low effort.
            if !skip_loop {
                while !state.budget_exhausted() && !state.is_canceled() {
                    history.push(loop_instruction(&request.id, state.plan.as_ref()));
                    let (loop_text, loop_calls, _) = self
                        .call_model(
                            &executor_model,
                            request,
                            state,
                            history.clone(),
                            loop_schemas.clone(),
                            false,
                            Some(ReasoningEffort::Low),
                            "executor",
                        )
                        .await?;
                    if loop_calls.is_empty() {
                        // SYNTHESIZE signal (or any final text): done
                        // gathering.
                        debug!(rid = %request.id, "executor model signaled synthesis");
                        break;
                    }
                    let outcome = dispatch_round(
                        loop_text,
                        loop_calls,
                        request,
                        state,
                        &self.tools,
                        &self.bus,
                        self.sink.as_ref(),
                    )
                    .await;
                    history.extend(outcome.messages);
                    self.post_round(request, state, &mut history).await;
                    if outcome.pulse_ended || outcome.budget_exhausted {
                        break;
                    }
                }
            }
            skip_loop = false;
            if state.is_canceled() {
                return Err(ExecutorError::Canceled);
            }

            // 7. Synthesis preparation: drop the loop scaffolding, offer the
            //    replan affordance.
            strip_loop_instructions(&mut history, &request.id);
            strip_plan_messages(&mut history);
            if let Some(plan) = &state.plan {
                history.push(replan_instruction(plan));
            }

            // 8. Synthesis on the primary, original streaming mode.
            let effort = self
                .config
                .reasoning_effort
                .or(Some(ReasoningEffort::Medium));
            let (synth_text, synth_calls, _) = self
                .call_model(
                    &self.primary,
                    request,
                    state,
                    history.clone(),
                    self.entity_schemas(true),
                    request.stream,
                    effort,
                    "synthesis",
                )
                .await?;

            // 10. No tool calls: the synthesis text is the answer.
            if synth_calls.is_empty() {
                return self.finish(request, state, history, synth_text).await;
            }

            // 9. Replan or continuation.
            let plan_call = synth_calls.iter().find(|tc| is_plan_call(&tc.name));
            if let Some(pc) = plan_call {
                if state.replan_count >= MAX_REPLAN_SAFETY_CAP {
                    warn!(
                        rid = %request.id,
                        "replan cap reached; returning synthesis response as-is"
                    );
                    return self.finish(request, state, history, synth_text).await;
                }
                if let Some(new_plan) = parse_plan(&pc.arguments) {
                    if state.register_plan(new_plan.clone()) {
                        state.replan_count += 1;
                        self.sink.emit(
                            LogEvent::new(&request.id, EventKind::PlanReplan)
                                .field("goal", new_plan.goal)
                                .field("replan_count", state.replan_count),
                        );
                    }
                }
                seed = Some((synth_text, synth_calls));
                continue;
            }

            // Continuation: run the round, then come straight back to
            // synthesis.
            self.sink.emit(
                LogEvent::new(&request.id, EventKind::PlanContinuation)
                    .field("tool_count", synth_calls.len()),
            );
            seed = Some((synth_text, synth_calls));
            skip_loop = true;
        }
    }

    /// Single-model fallback: one dispatcher round, rehydrate, re-prompt the
    /// primary; repeat until it answers in text or the budget runs out.
    async fn run_fallback(
        &self,
        request: &Request,
        state: &mut RequestState,
        mut history: Vec<Message>,
        text: String,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<FinalResponse, ExecutorError> {
        let mut seed = (text, tool_calls);
        loop {
            if state.is_canceled() {
                return Err(ExecutorError::Canceled);
            }
            let outcome = dispatch_round(
                seed.0,
                seed.1,
                request,
                state,
                &self.tools,
                &self.bus,
                self.sink.as_ref(),
            )
            .await;
            history.extend(outcome.messages);
            self.post_round(request, state, &mut history).await;

            // Full tool content is restored before every primary re-prompt.
            rehydrate(&mut history, &mut state.tool_result_store);

            let (t, tc, _) = self
                .call_model(
                    &self.primary,
                    request,
                    state,
                    history.clone(),
                    self.entity_schemas(true),
                    request.stream,
                    self.config.reasoning_effort,
                    "fallback",
                )
                .await?;
            if tc.is_empty() || state.budget_exhausted() || outcome.pulse_ended {
                return self.finish(request, state, history, t).await;
            }
            seed = (t, tc);
        }
    }

    /// Post-round context discipline: dehydrate fresh oversized results,
    /// compress results from earlier rounds, and run window compression when
    /// the estimate crosses the threshold.
    async fn post_round(
        &self,
        request: &Request,
        state: &mut RequestState,
        history: &mut Vec<Message>,
    ) {
        dehydrate_round(history, state.round, &mut state.tool_result_store);
        compress_older_tool_results(
            history,
            state.round,
            &mut state.tool_result_store,
            &self.tools,
        );
        let (rebuilt, stats) = compress_context_window(
            std::mem::take(history),
            self.primary.max_prompt_tokens(),
            self.config.compression_keep_recent,
            self.config.context_compression_threshold,
            self.summarizer.as_deref(),
        )
        .await;
        *history = rebuilt;
        if let Some(stats) = stats {
            self.sink.emit(
                LogEvent::new(&request.id, EventKind::Compression)
                    .field("tokens_before", stats.tokens_before)
                    .field("tokens_after", stats.tokens_after)
                    .field("compressed_messages", stats.compressed_messages),
            );
        }
    }

    /// One model call, streaming or not, unified to
    /// `(text, tool_calls, usage)`.
    #[allow(clippy::too_many_arguments)]
    async fn call_model(
        &self,
        provider: &Arc<dyn ModelProvider>,
        request: &Request,
        state: &mut RequestState,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
        stream: bool,
        reasoning_effort: Option<ReasoningEffort>,
        phase: &str,
    ) -> Result<(String, Vec<ToolCallRecord>, Option<Usage>), ExecutorError> {
        if state.is_canceled() {
            return Err(ExecutorError::Canceled);
        }
        self.sink.emit(
            LogEvent::new(&request.id, EventKind::ModelCall)
                .field("model", provider.name().to_string())
                .field("phase", phase.to_string())
                .field("stream", stream)
                .field("message_count", messages.len())
                .field("tool_count", tools.len()),
        );
        let req = CompletionRequest {
            messages,
            tools,
            tool_choice: ToolChoice::Auto,
            stream,
            reasoning_effort,
            model_override: None,
        };
        let (text, tool_calls, usage) = if stream {
            let s = provider
                .complete_streaming(req)
                .await
                .map_err(|e| ExecutorError::ModelCall(e.to_string()))?;
            let out = drain_stream(s, request, state, &self.bus).await?;
            (out.text, out.tool_calls, out.usage)
        } else {
            let r = provider
                .complete(req)
                .await
                .map_err(|e| ExecutorError::ModelCall(e.to_string()))?;
            (r.content, r.tool_calls, r.usage)
        };
        if let Some(u) = usage {
            state.result_data.usage.accumulate(u);
        }
        self.sink.emit(
            LogEvent::new(&request.id, EventKind::ModelResult)
                .field("phase", phase.to_string())
                .field("text_len", text.len())
                .field("tool_call_count", tool_calls.len()),
        );
        Ok((text, tool_calls, usage))
    }

    /// Close out the request: empty-response safety net, history append,
    /// result data export, memory recording.
    async fn finish(
        &self,
        request: &Request,
        state: &mut RequestState,
        mut history: Vec<Message>,
        final_text: String,
    ) -> Result<FinalResponse, ExecutorError> {
        if final_text.is_empty() {
            return Err(ExecutorError::EmptyResponse);
        }
        history.push(Message::assistant(&final_text));

        let loop_start = history
            .iter()
            .rposition(|m| {
                m.role == Role::User && m.as_text() == Some(request.message.as_str())
            })
            .map(|i| i + 1)
            .unwrap_or(0);
        state.result_data.tool_history = dehydrate_tool_history(&history, loop_start);

        let kind = match request.invocation {
            InvocationType::Chat => MemoryKind::Chat,
            InvocationType::Pulse => MemoryKind::Pulse,
        };
        match self
            .memory
            .record(&self.entity.id, &request.id, kind, &request.message, &final_text)
            .await
        {
            Ok(()) => {
                self.sink.emit(
                    LogEvent::new(&request.id, EventKind::MemoryRecord)
                        .field("kind", if kind == MemoryKind::Pulse { "pulse" } else { "chat" }),
                );
            }
            Err(e) => warn!(rid = %request.id, "memory recording failed: {e}"),
        }

        Ok(FinalResponse { text: final_text, history })
    }

    fn entity_schemas(&self, include_plan: bool) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .schemas()
            .iter()
            .map(|s| ToolSchema {
                name: s.name.clone(),
                description: s.description.clone(),
                parameters: s.parameters.clone(),
            })
            .collect();
        if include_plan {
            schemas.push(plan_tool_schema());
        }
        schemas
    }
}
