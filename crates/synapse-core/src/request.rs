// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use synapse_config::constants::TOOL_BUDGET;
use synapse_config::InvocationType;
use synapse_model::{Message, Usage};

use crate::plan::Plan;

/// One inbound query (or autonomous pulse wake) against an entity.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    /// Set on nested sub-pathway calls; `None` marks the root request that
    /// owns the terminal progress event.
    pub root_id: Option<String>,
    pub entity_id: String,
    pub message: String,
    /// Inbound conversation history (already transport-normalized).
    pub history: Vec<Message>,
    pub stream: bool,
    pub invocation: InvocationType,
    /// Nesting depth of sub-pathway callbacks; 0 for a client request.
    pub callback_depth: u32,
}

impl Request {
    pub fn chat(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            root_id: None,
            entity_id: entity_id.into(),
            message: message.into(),
            history: Vec::new(),
            stream: false,
            invocation: InvocationType::Chat,
            callback_depth: 0,
        }
    }

    pub fn pulse(entity_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            invocation: InvocationType::Pulse,
            ..Self::chat(entity_id, prompt)
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Mark this request as a nested sub-pathway call under `root_id`.
    pub fn nested(mut self, root_id: impl Into<String>, depth: u32) -> Self {
        self.root_id = Some(root_id.into());
        self.callback_depth = depth;
        self
    }

    pub fn is_root(&self) -> bool {
        self.root_id.is_none()
    }

    /// The id progress events are published under: the root of the pathway.
    pub fn progress_id(&self) -> &str {
        self.root_id.as_deref().unwrap_or(&self.id)
    }
}

/// Full tool-result content captured out of the live history so older rounds
/// can be compressed and, on the fallback path, restored before synthesis.
#[derive(Debug, Clone)]
pub struct ToolResultStoreEntry {
    pub tool_name: String,
    pub full_content: String,
    pub char_count: usize,
    /// Round number when the result was first captured.
    pub round: u32,
    pub compressed: bool,
}

/// Result data attached to the terminal progress event for the client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PathwayResultData {
    pub citations: Vec<String>,
    pub usage: Usage,
    /// Dehydrated assistant/tool-response pairs from the tool loop.
    pub tool_history: Vec<Message>,
    /// Names of tools that actually executed.
    pub tool_used: Vec<String>,
}

/// Cooperative cancellation flag shared between the coordinator and the
/// request's task.  Setting it stops new model calls and tool rounds; work
/// already in flight runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Mutable per-request state.
///
/// Owned by the coordinator and passed `&mut` through the executor and
/// dispatcher: the single-owner replacement for the source's mutable
/// "resolver" object threaded through async calls.
#[derive(Debug, Default)]
pub struct RequestState {
    pub budget: u32,
    pub round: u32,
    pub replan_count: u32,
    pub gate_retries: u32,
    pub plan: Option<Plan>,
    /// Keyed by tool call id; one entry for the lifetime of the request.
    pub tool_result_store: HashMap<String, ToolResultStoreEntry>,
    /// `<toolName>:<argumentsJSON>` → most recent result content.
    pub tool_call_cache: HashMap<String, String>,
    /// Text streamed to the client so far.
    pub streamed_content: String,
    /// Set once the stream pipeline has already published the terminal
    /// event; the coordinator then suppresses its own.
    pub completion_sent: bool,
    pub result_data: PathwayResultData,
    cancel: CancelHandle,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget >= TOOL_BUDGET
    }

    /// Charge `cost` (already clamped by the tool definition) against the
    /// request budget.
    pub fn charge(&mut self, cost: u32) {
        self.budget = self.budget.saturating_add(cost);
    }

    /// Force the budget to the cap so the loop exits on the next check.
    pub fn exhaust_budget(&mut self) {
        self.budget = TOOL_BUDGET;
    }

    /// Store `plan` as the active plan.  Returns `true` when this replaced a
    /// *different* active plan (a true replan); re-registering an identical
    /// plan is a no-op for replan accounting.
    pub fn register_plan(&mut self, plan: Plan) -> bool {
        let replaced = match &self.plan {
            Some(existing) => *existing != plan,
            None => false,
        };
        self.plan = Some(plan);
        replaced
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
