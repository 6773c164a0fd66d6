// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parallel tool-call dispatch: budget accounting, duplicate detection,
//! argument sanitation, timeout enforcement, and deterministic result
//! merging.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use synapse_model::{Message, ToolCallRecord};
use synapse_tools::{voice_line, EntityTools};

use crate::log::{EventKind, EventSink, LogEvent};
use crate::plan::{is_plan_call, parse_plan};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::request::{Request, RequestState};

use synapse_config::constants::{DEFAULT_TOOL_COST, MAX_TOOL_RESULT_LENGTH, TOOL_BUDGET};

/// Infrastructure-level argument keys the model must not control.  Stripped
/// before the arguments reach any tool.
const RESERVED_ARG_KEYS: &[&str] = &[
    "entityId",
    "contextId",
    "entityTools",
    "entityToolsOpenAiFormat",
    "entityInstructions",
    "agentContext",
    "invocationType",
    "primaryModel",
    "configuredReasoningEffort",
];

const DUPLICATE_PREFIX: &str = "This tool was already called with these exact arguments. Previous result: ";
const TRUNCATION_NOTICE: &str = "[Content truncated due to length]";
const INVALID_ARGS_MESSAGE: &str = "Invalid tool call structure: missing function arguments";
const PLAN_RECORDED_MESSAGE: &str = "Plan recorded.";

/// Per-round statistics for the event log.
#[derive(Debug, Clone, Copy)]
pub struct RoundStats {
    pub round: u32,
    pub tool_count: usize,
    pub failed_count: usize,
    pub budget_used: u32,
    pub budget_total: u32,
}

/// Outcome of one dispatch round.
pub struct RoundOutcome {
    /// One assistant message carrying every tool call, followed by the
    /// tool-response messages (plan responses first, then call order).
    pub messages: Vec<Message>,
    pub budget_exhausted: bool,
    /// An `EndPulse` tool executed in this round.
    pub pulse_ended: bool,
    pub stats: RoundStats,
}

struct ToolRunResult {
    call_id: String,
    name: String,
    content: String,
    success: bool,
    executed: bool,
}

/// Execute one round of tool calls in parallel.
///
/// Plan (`SetGoals`) calls never execute and never charge budget: their
/// arguments are parsed into the request plan and answered with a canned
/// success response either way.  Real calls run concurrently, each under its
/// declared timeout; results are merged deterministically regardless of
/// completion order.
pub async fn dispatch_round(
    assistant_text: String,
    tool_calls: Vec<ToolCallRecord>,
    request: &Request,
    state: &mut RequestState,
    tools: &EntityTools,
    bus: &Arc<ProgressBus>,
    sink: &dyn EventSink,
) -> RoundOutcome {
    state.round += 1;
    let round = state.round;

    // A call with no name cannot be dispatched or answered; treating the
    // round as invalid and exhausting the budget guarantees loop exit.
    if tool_calls.iter().any(|tc| tc.name.is_empty()) {
        warn!(round, "tool call with missing name; forcing budget exhaustion");
        state.exhaust_budget();
        return RoundOutcome {
            messages: Vec::new(),
            budget_exhausted: true,
            pulse_ended: false,
            stats: RoundStats {
                round,
                tool_count: 0,
                failed_count: 0,
                budget_used: state.budget,
                budget_total: TOOL_BUDGET,
            },
        };
    }

    let (plan_calls, real_calls): (Vec<&ToolCallRecord>, Vec<&ToolCallRecord>) =
        tool_calls.iter().partition(|tc| is_plan_call(&tc.name));

    // Plan calls: parse and store; the tool-response is a success either way
    // (an unparseable plan is simply not recorded).
    let mut plan_responses = Vec::with_capacity(plan_calls.len());
    for pc in &plan_calls {
        if let Some(plan) = parse_plan(&pc.arguments) {
            sink.emit(
                LogEvent::new(&request.id, EventKind::PlanCreated)
                    .field("goal", plan.goal.clone())
                    .field("steps", plan.steps.len()),
            );
            for (i, step) in plan.steps.iter().enumerate() {
                sink.emit(
                    LogEvent::new(&request.id, EventKind::PlanStep)
                        .field("index", i + 1)
                        .field("step", step.clone()),
                );
            }
            state.register_plan(plan);
        } else {
            warn!(round, "unparseable SetGoals arguments; plan not recorded");
        }
        plan_responses.push(Message::tool_response(
            &pc.id,
            &pc.name,
            PLAN_RECORDED_MESSAGE,
        ));
    }

    // Charge the budget up front: every real call costs max(1, declared),
    // duplicates included (the model pays for re-asking).
    for rc in &real_calls {
        let cost = tools
            .get(&rc.name)
            .map(|t| t.definition().effective_cost())
            .unwrap_or(DEFAULT_TOOL_COST);
        state.charge(cost);
    }

    // Spawn every real call, skipping execution for duplicate-cache hits.
    let mut tasks: Vec<ToolTask> = Vec::with_capacity(real_calls.len());
    for rc in &real_calls {
        let cache_key = format!("{}:{}", rc.name, rc.arguments);
        if let Some(cached) = state.tool_call_cache.get(&cache_key) {
            tasks.push(ToolTask::CacheHit {
                call_id: rc.id.clone(),
                name: rc.name.clone(),
                content: format!("{DUPLICATE_PREFIX}{cached}"),
            });
            continue;
        }
        let handle = spawn_tool(rc, request, tools, bus);
        tasks.push(ToolTask::Running {
            cache_key,
            handle,
            call_id: rc.id.clone(),
            name: rc.name.clone(),
        });
    }

    // Await in call order so merging stays deterministic.
    let mut results: Vec<ToolRunResult> = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task {
            ToolTask::CacheHit { call_id, name, content } => {
                results.push(ToolRunResult {
                    call_id,
                    name,
                    content,
                    success: true,
                    executed: false,
                });
            }
            ToolTask::Running { cache_key, handle, call_id, name } => {
                let (content, success) = match handle.await {
                    Ok(r) => r,
                    Err(e) => (format!("{name} panicked: {e}"), false),
                };
                state.tool_call_cache.insert(cache_key, content.clone());
                results.push(ToolRunResult {
                    call_id,
                    name,
                    content,
                    success,
                    executed: true,
                });
            }
        }
    }

    let failed_count = results.iter().filter(|r| !r.success).count();
    let pulse_ended = results
        .iter()
        .any(|r| r.executed && r.name.eq_ignore_ascii_case("EndPulse"));

    for r in &results {
        sink.emit(
            LogEvent::new(&request.id, EventKind::ToolExec)
                .field("tool", r.name.clone())
                .field("call_id", r.call_id.clone())
                .field("success", r.success)
                .field("cached", !r.executed),
        );
        if r.executed && !state.result_data.tool_used.iter().any(|t| t == &r.name) {
            state.result_data.tool_used.push(r.name.clone());
        }
    }

    let stats = RoundStats {
        round,
        tool_count: real_calls.len(),
        failed_count,
        budget_used: state.budget,
        budget_total: TOOL_BUDGET,
    };
    sink.emit(
        LogEvent::new(&request.id, EventKind::ToolRound)
            .field("round", round)
            .field("tool_count", stats.tool_count)
            .field("failed_count", failed_count)
            .field("budget_used", state.budget)
            .field("budget_total", TOOL_BUDGET),
    );

    // Merge: one assistant message with every call, then plan responses,
    // then real responses in call order.
    let mut messages = vec![Message::assistant_with_tool_calls(
        assistant_text,
        tool_calls.clone(),
    )];
    messages.extend(plan_responses);
    for r in results {
        messages.push(Message::tool_response(&r.call_id, &r.name, r.content));
    }

    RoundOutcome {
        messages,
        budget_exhausted: state.budget_exhausted(),
        pulse_ended,
        stats,
    }
}

enum ToolTask {
    CacheHit {
        call_id: String,
        name: String,
        content: String,
    },
    Running {
        cache_key: String,
        handle: tokio::task::JoinHandle<(String, bool)>,
        call_id: String,
        name: String,
    },
}

/// Spawn one tool invocation: sanitize arguments, publish the start event,
/// run under the declared timeout, classify, truncate, publish the finish
/// event.  Returns `(content, success)`.
fn spawn_tool(
    call: &ToolCallRecord,
    request: &Request,
    tools: &EntityTools,
    bus: &Arc<ProgressBus>,
) -> tokio::task::JoinHandle<(String, bool)> {
    let tool = tools.get(&call.name);
    let name = call.name.clone();
    let arguments = call.arguments.clone();
    let bus = Arc::clone(bus);
    let progress_id = request.progress_id().to_string();

    tokio::spawn(async move {
        let Some(tool) = tool else {
            return (format!("Unknown tool: {name}"), false);
        };
        let def = tool.definition().clone();

        let parsed: Option<Value> = serde_json::from_str(&arguments).ok();
        let Some(mut args) = parsed.filter(Value::is_object) else {
            return (INVALID_ARGS_MESSAGE.to_string(), false);
        };

        let user_message = args["userMessage"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| voice_line(&name));
        if let Some(obj) = args.as_object_mut() {
            for key in RESERVED_ARG_KEYS {
                obj.remove(*key);
            }
        }

        if !def.hide_execution {
            let data = json!({
                "event": "tool.start",
                "tool": def.name,
                "icon": def.icon,
                "message": user_message,
            });
            bus.publish(ProgressEvent::partial(&progress_id, 0.3, data.to_string()));
        }

        let (content, success) =
            match tokio::time::timeout(def.timeout, tool.execute(args)).await {
                Ok(Ok(value)) => classify_result(value),
                Ok(Err(e)) => (
                    crate::error::ExecutorError::ToolExecution {
                        tool: name.clone(),
                        message: e.to_string(),
                    }
                    .to_string(),
                    false,
                ),
                Err(_) => (
                    crate::error::ExecutorError::ToolTimeout {
                        tool: name.clone(),
                        seconds: def.timeout.as_secs(),
                    }
                    .to_string(),
                    false,
                ),
            };
        let content = truncate_result(content);

        if !def.hide_execution {
            let data = json!({
                "event": "tool.finish",
                "tool": def.name,
                "success": success,
                "error": if success { Value::Null } else { json!(content) },
            });
            bus.publish(ProgressEvent::partial(&progress_id, 0.6, data.to_string()));
        }

        (content, success)
    })
}

fn classify_result(value: Value) -> (String, bool) {
    let content = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    // An explicit error field (on the value itself or inside a
    // JSON-in-string payload) marks the call failed.
    let has_error = match &value {
        Value::Object(obj) => obj.get("error").map(|e| !e.is_null()).unwrap_or(false),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.get("error").map(|e| !e.is_null()))
            .unwrap_or(false),
        _ => false,
    };
    (content, !has_error)
}

fn truncate_result(content: String) -> String {
    if content.len() <= MAX_TOOL_RESULT_LENGTH {
        return content;
    }
    let mut cut = MAX_TOOL_RESULT_LENGTH;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_NOTICE}", &content[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use synapse_config::{EntityConfig, InvocationType};
    use synapse_tools::{Tool, ToolDefinition, ToolRegistry};

    use super::*;
    use crate::log::NullSink;

    struct CountingTool {
        def: ToolDefinition,
        invocations: Arc<AtomicUsize>,
        reply: Value,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct SlowTool {
        def: ToolDefinition,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(json!("too late"))
        }
    }

    struct ArgEchoTool {
        def: ToolDefinition,
        seen: Arc<std::sync::Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Tool for ArgEchoTool {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }
        async fn execute(&self, args: Value) -> anyhow::Result<Value> {
            self.seen.lock().unwrap().push(args);
            Ok(json!("ok"))
        }
    }

    fn harness(
        reg: ToolRegistry,
    ) -> (Request, RequestState, EntityTools, Arc<ProgressBus>) {
        let entity = EntityConfig {
            id: "e1".into(),
            tools: vec!["*".into()],
            ..Default::default()
        };
        let tools = reg.tools_for_entity(&entity, InvocationType::Chat);
        (
            Request::chat("e1", "hi"),
            RequestState::new(),
            tools,
            Arc::new(ProgressBus::new()),
        )
    }

    fn counting_registry(reply: Value) -> (ToolRegistry, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(CountingTool {
            def: ToolDefinition::new("Weather", "weather", json!({"type": "object"})),
            invocations: Arc::clone(&invocations),
            reply,
        });
        (reg, invocations)
    }

    #[tokio::test]
    async fn round_merges_calls_and_responses_in_order() {
        let (reg, _inv) = counting_registry(json!("Sunny, 15°C"));
        let (req, mut state, tools, bus) = harness(reg);
        let calls = vec![
            ToolCallRecord::new("p1", "SetGoals", r#"{"goal":"g","steps":["a","b"]}"#),
            ToolCallRecord::new("c1", "Weather", r#"{"city":"Paris"}"#),
        ];
        let out =
            dispatch_round(String::new(), calls, &req, &mut state, &tools, &bus, &NullSink)
                .await;

        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].tool_calls.len(), 2, "all calls on one assistant message");
        // Plan response first, then call order.
        assert_eq!(out.messages[1].tool_call_id.as_deref(), Some("p1"));
        assert_eq!(out.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(out.messages[2].as_text(), Some("Sunny, 15°C"));
        assert!(state.plan.is_some());
        assert_eq!(state.budget, 10, "plan call never charges");
        assert_eq!(state.round, 1);
    }

    #[tokio::test]
    async fn duplicate_call_hits_cache_and_charges_budget() {
        let (reg, invocations) = counting_registry(json!("result-1"));
        let (req, mut state, tools, bus) = harness(reg);
        let call = ToolCallRecord::new("c1", "Weather", r#"{"city":"Paris"}"#);

        let _ = dispatch_round(
            String::new(),
            vec![call.clone()],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        let mut second = call.clone();
        second.id = "c2".into();
        let out = dispatch_round(
            String::new(),
            vec![second],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1, "handler ran exactly once");
        let text = out.messages[1].as_text().unwrap();
        assert!(text.starts_with("This tool was already called with these exact arguments."));
        assert!(text.contains("result-1"));
        assert_eq!(state.budget, 20, "duplicate still charges");
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_response() {
        let (req, mut state, tools, bus) = harness(ToolRegistry::new());
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Nope", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert_eq!(out.messages[1].as_text(), Some("Unknown tool: Nope"));
        assert_eq!(out.stats.failed_count, 1);
        assert_eq!(state.budget, 10, "unknown tools charge the default cost");
    }

    #[tokio::test]
    async fn invalid_arguments_yield_error_response() {
        let (reg, invocations) = counting_registry(json!("x"));
        let (req, mut state, tools, bus) = harness(reg);
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Weather", "not json")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert_eq!(
            out.messages[1].as_text(),
            Some("Invalid tool call structure: missing function arguments")
        );
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(out.stats.failed_count, 1);
    }

    #[tokio::test]
    async fn missing_name_force_exhausts_budget() {
        let (reg, _inv) = counting_registry(json!("x"));
        let (req, mut state, tools, bus) = harness(reg);
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert!(out.budget_exhausted);
        assert!(out.messages.is_empty());
        assert!(state.budget_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_produces_timeout_message() {
        let mut reg = ToolRegistry::new();
        reg.register(SlowTool {
            def: ToolDefinition::new("Slow", "slow", json!({"type": "object"}))
                .with_timeout(std::time::Duration::from_secs(2)),
        });
        let (req, mut state, tools, bus) = harness(reg);
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Slow", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert_eq!(out.messages[1].as_text(), Some("Slow timed out after 2s"));
        assert_eq!(out.stats.failed_count, 1);
    }

    #[tokio::test]
    async fn reserved_keys_are_stripped_before_execution() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ArgEchoTool {
            def: ToolDefinition::new("Echo", "echo", json!({"type": "object"})),
            seen: Arc::clone(&seen),
        });
        let (req, mut state, tools, bus) = harness(reg);
        let args = json!({
            "q": "real",
            "entityId": "stolen",
            "agentContext": {"x": 1},
            "primaryModel": "gpt-99"
        })
        .to_string();
        let _ = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Echo", args)],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], json!({"q": "real"}));
    }

    #[tokio::test]
    async fn structured_error_payload_marks_failure() {
        let (reg, _inv) = counting_registry(json!({"error": "quota exceeded"}));
        let (req, mut state, tools, bus) = harness(reg);
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Weather", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert_eq!(out.stats.failed_count, 1);
        assert!(out.messages[1].as_text().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn oversized_result_is_truncated() {
        let (reg, _inv) = counting_registry(json!("y".repeat(200_000)));
        let (req, mut state, tools, bus) = harness(reg);
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Weather", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        let text = out.messages[1].as_text().unwrap();
        assert!(text.ends_with("[Content truncated due to length]"));
        assert!(text.len() <= MAX_TOOL_RESULT_LENGTH + TRUNCATION_NOTICE.len());
    }

    #[tokio::test]
    async fn parallel_calls_preserve_call_order() {
        let mut reg = ToolRegistry::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        reg.register(CountingTool {
            def: ToolDefinition::new("SearchNews", "news", json!({"type": "object"})),
            invocations: Arc::clone(&invocations),
            reply: json!("headline"),
        });
        let (req, mut state, tools, bus) = harness(reg);
        let calls = vec![
            ToolCallRecord::new("c1", "SearchNews", r#"{"q":"openai"}"#),
            ToolCallRecord::new("c2", "SearchNews", r#"{"q":"anthropic"}"#),
        ];
        let out =
            dispatch_round(String::new(), calls, &req, &mut state, &tools, &bus, &NullSink)
                .await;
        assert_eq!(out.messages[0].tool_calls.len(), 2);
        assert_eq!(out.messages[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(out.messages[2].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(state.budget, 20);
    }

    #[tokio::test]
    async fn start_and_finish_events_published_in_order() {
        let (reg, _inv) = counting_registry(json!("ok"));
        let (req, mut state, tools, bus) = harness(reg);
        let mut rx = bus.subscribe(&req.id);
        let _ = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Weather", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.data.contains("tool.start"));
        assert!(second.data.contains("tool.finish"));
    }

    #[tokio::test]
    async fn hidden_tool_publishes_no_events() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(CountingTool {
            def: ToolDefinition::new("Quiet", "quiet", json!({"type": "object"})).hidden(),
            invocations,
            reply: json!("shh"),
        });
        let (req, mut state, tools, bus) = harness(reg);
        let mut rx = bus.subscribe(&req.id);
        let _ = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new("c1", "Quiet", "{}")],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert!(rx.try_recv().is_err(), "hide_execution suppresses events");
    }

    #[tokio::test]
    async fn endpulse_execution_flags_pulse_ended() {
        let mut reg = ToolRegistry::new();
        reg.register(synapse_tools::EndPulseTool::default());
        let entity = EntityConfig {
            id: "e1".into(),
            tools: vec![],
            ..Default::default()
        };
        let tools = reg.tools_for_entity(&entity, InvocationType::Pulse);
        let req = Request::pulse("e1", "wake");
        let mut state = RequestState::new();
        let bus = Arc::new(ProgressBus::new());
        let out = dispatch_round(
            String::new(),
            vec![ToolCallRecord::new(
                "c1",
                "EndPulse",
                r#"{"reflection":"Journaled about X."}"#,
            )],
            &req,
            &mut state,
            &tools,
            &bus,
            &NullSink,
        )
        .await;
        assert!(out.pulse_ended);
        assert_eq!(state.budget, 1, "EndPulse declares cost 1");
    }
}
