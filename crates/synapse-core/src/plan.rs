// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::json;

use synapse_config::InvocationType;
use synapse_model::{Message, Role, ToolCallRecord, ToolSchema};

/// The plan declaration tool injected by the core (never registered by
/// entities).
pub const PLAN_TOOL_NAME: &str = "SetGoals";

/// A declared plan: one goal and a short checklist of outcomes.
///
/// Replacement is atomic: a replan swaps the whole value; steps are never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<String>,
}

/// Parse `SetGoals` arguments into a plan.  Returns `None` for malformed
/// JSON or a missing goal; the dispatcher still answers such calls with a
/// success tool-response, it just records nothing.
pub fn parse_plan(arguments: &str) -> Option<Plan> {
    let plan: Plan = serde_json::from_str(arguments).ok()?;
    if plan.goal.is_empty() {
        return None;
    }
    Some(plan)
}

pub fn is_plan_call(name: &str) -> bool {
    name.eq_ignore_ascii_case(PLAN_TOOL_NAME)
}

/// The plan-with-tools contract: a tool-calling turn passes only when it
/// includes a `SetGoals` call.
pub fn passes_gate(tool_calls: &[ToolCallRecord]) -> bool {
    !tool_calls.is_empty() && tool_calls.iter().any(|tc| is_plan_call(&tc.name))
}

/// Whether the gate is enforced at all: pulse wakes run gate-free, and
/// nested callback depths > 1 were already gated by the outer level.
pub fn gate_applies(invocation: InvocationType, callback_depth: u32) -> bool {
    invocation != InvocationType::Pulse && callback_depth <= 1
}

/// Schema for the `SetGoals` tool as declared to the model.
pub fn plan_tool_schema() -> ToolSchema {
    ToolSchema {
        name: PLAN_TOOL_NAME.into(),
        description: "Declare everything that needs to happen before this request is done: \
                      one goal sentence and 2-5 concrete steps. Call this together with your \
                      other tool calls on any turn that uses tools."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "goal": {
                    "type": "string",
                    "description": "One sentence describing what this request needs."
                },
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 2,
                    "maxItems": 5,
                    "description": "Concrete outcomes to reach, in any order."
                }
            },
            "required": ["goal", "steps"]
        }),
    }
}

// ─── Instruction injections ───────────────────────────────────────────────────

const LOOP_MARKER: &str = "[loop instruction:";

/// Admonishment injected when a tool-calling turn skipped `SetGoals`.
pub fn gate_admonishment(request_id: &str) -> Message {
    Message::user(format!(
        "[system message: {request_id}] Your tool calls were discarded because they did not \
         include SetGoals. Declare your goal and 2-5 steps with SetGoals, then re-issue the \
         tool calls you need in the same turn."
    ))
}

/// Per-iteration instruction for the executor model, tagged with the request
/// id so every injection can be stripped before synthesis.
pub fn loop_instruction(request_id: &str, plan: Option<&Plan>) -> Message {
    let body = match plan {
        Some(plan) => {
            let mut text = format!("TODO — Goal: {}\n", plan.goal);
            for (i, step) in plan.steps.iter().enumerate() {
                text.push_str(&format!("  {}. {}\n", i + 1, step));
            }
            text.push_str(
                "\nLook at the tool results already in the conversation. If an item is \
                 satisfied by existing results, skip it. Call tools only for items with no \
                 results yet. Batch as many as possible. Do NOT retry a tool that already \
                 failed. Respond with SYNTHESIZE when all items are addressed.",
            );
            text
        }
        None => "If you need more information, call tools. Otherwise respond with: SYNTHESIZE"
            .to_string(),
    };
    Message::user(format!("{LOOP_MARKER} {request_id}] {body}"))
}

/// Remove every loop instruction previously injected for `request_id`.
pub fn strip_loop_instructions(messages: &mut Vec<Message>, request_id: &str) {
    let prefix = format!("{LOOP_MARKER} {request_id}]");
    messages.retain(|m| {
        !(m.role == Role::User
            && m.as_text().map(|t| t.starts_with(&prefix)).unwrap_or(false))
    });
}

/// Replan affordance injected before synthesis when a plan is active.
pub fn replan_instruction(plan: &Plan) -> Message {
    Message::user(format!(
        "Review the tool results above against your todo list (Goal: {}). If results are \
         sufficient, respond to the user. If you need a different strategy, call SetGoals \
         with a new todo list (and optionally other tools).",
        plan.goal
    ))
}

/// Remove `SetGoals` calls and their responses from the history so the
/// executor model stays focused on the remaining steps.  Assistant messages
/// left with no content and no calls are dropped entirely.
pub fn strip_plan_messages(messages: &mut Vec<Message>) {
    let mut plan_call_ids: Vec<String> = Vec::new();
    for m in messages.iter_mut() {
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            for tc in m.tool_calls.iter().filter(|tc| is_plan_call(&tc.name)) {
                plan_call_ids.push(tc.id.clone());
            }
            m.tool_calls.retain(|tc| !is_plan_call(&tc.name));
        }
    }
    messages.retain(|m| {
        if m.role == Role::Tool {
            let answers_plan = m
                .tool_call_id
                .as_deref()
                .map(|id| plan_call_ids.iter().any(|p| p == id))
                .unwrap_or(false)
                || m.name.as_deref().map(is_plan_call).unwrap_or(false);
            return !answers_plan;
        }
        if m.role == Role::Assistant {
            return !m.tool_calls.is_empty() || !m.content.is_empty();
        }
        true
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ToolCallRecord {
        ToolCallRecord::new("c1", name, "{}")
    }

    #[test]
    fn gate_passes_with_setgoals_case_insensitive() {
        assert!(passes_gate(&[call("SetGoals")]));
        assert!(passes_gate(&[call("setgoals"), call("Weather")]));
        assert!(!passes_gate(&[call("Weather")]));
        assert!(!passes_gate(&[]));
    }

    #[test]
    fn gate_skipped_for_pulse_and_deep_callbacks() {
        assert!(gate_applies(InvocationType::Chat, 0));
        assert!(gate_applies(InvocationType::Chat, 1));
        assert!(!gate_applies(InvocationType::Chat, 2));
        assert!(!gate_applies(InvocationType::Pulse, 0));
    }

    #[test]
    fn parse_plan_accepts_valid_arguments() {
        let p = parse_plan(r#"{"goal":"Answer","steps":["look up","reply"]}"#).unwrap();
        assert_eq!(p.goal, "Answer");
        assert_eq!(p.steps.len(), 2);
    }

    #[test]
    fn parse_plan_rejects_garbage() {
        assert!(parse_plan("not json").is_none());
        assert!(parse_plan(r#"{"steps":["a","b"]}"#).is_none());
        assert!(parse_plan(r#"{"goal":"","steps":["a","b"]}"#).is_none());
    }

    #[test]
    fn loop_instruction_renders_todo_list() {
        let plan = Plan { goal: "G".into(), steps: vec!["s1".into(), "s2".into()] };
        let m = loop_instruction("rid-1", Some(&plan));
        let text = m.as_text().unwrap();
        assert!(text.contains("TODO — Goal: G"));
        assert!(text.contains("1. s1"));
        assert!(text.contains("SYNTHESIZE"));
    }

    #[test]
    fn loop_instruction_generic_form_without_plan() {
        let m = loop_instruction("rid-1", None);
        assert!(m
            .as_text()
            .unwrap()
            .contains("Otherwise respond with: SYNTHESIZE"));
    }

    #[test]
    fn strip_loop_instructions_removes_only_own_rid() {
        let mut msgs = vec![
            Message::user("real question"),
            loop_instruction("rid-1", None),
            loop_instruction("rid-2", None),
        ];
        strip_loop_instructions(&mut msgs, "rid-1");
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].as_text().unwrap().contains("rid-2"));
    }

    #[test]
    fn strip_plan_messages_removes_call_and_response() {
        let mut msgs = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCallRecord::new("p1", "SetGoals", r#"{"goal":"g","steps":["a","b"]}"#),
                    ToolCallRecord::new("c1", "Weather", "{}"),
                ],
            ),
            Message::tool_response("p1", "SetGoals", "Plan recorded."),
            Message::tool_response("c1", "Weather", "Sunny"),
        ];
        strip_plan_messages(&mut msgs);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].tool_calls.len(), 1);
        assert_eq!(msgs[0].tool_calls[0].name, "Weather");
        assert_eq!(msgs[1].name.as_deref(), Some("Weather"));
    }

    #[test]
    fn strip_plan_messages_drops_empty_assistant_shell() {
        let mut msgs = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCallRecord::new("p1", "SetGoals", "{}")],
            ),
            Message::tool_response("p1", "SetGoals", "Plan recorded."),
        ];
        strip_plan_messages(&mut msgs);
        assert!(msgs.is_empty());
    }
}
