// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use synapse_config::constants::{DEFAULT_TOOL_COST, TOOL_TIMEOUT};

/// Where a tool is allowed to appear.
///
/// `General` tools are available everywhere.  `System` tools must be listed
/// explicitly in the entity's tool list (the `"*"` wildcard never expands to
/// them).  `Pulse` tools exist only during autonomous pulse wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCategory {
    #[default]
    General,
    System,
    Pulse,
}

/// Static description of a tool as declared to the model and the dispatcher.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
    pub category: ToolCategory,
    /// Budget charged per invocation; clamped to a minimum of 1.
    pub cost: u32,
    /// Per-invocation execution deadline.
    pub timeout: Duration,
    /// Suppress the user-visible start/finish progress events.
    pub hide_execution: bool,
    /// Icon name attached to the start event.
    pub icon: Option<String>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category: ToolCategory::General,
            cost: DEFAULT_TOOL_COST,
            timeout: TOOL_TIMEOUT,
            hide_execution: false,
            icon: None,
        }
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hide_execution = true;
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Budget charge for one invocation.
    pub fn effective_cost(&self) -> u32 {
        self.cost.max(1)
    }
}

/// Trait that every tool available to an entity must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    /// Map a full result onto a short summary for context compression.
    /// `None` falls back to the default summarizer.
    fn summarize(&self, _full: &str) -> Option<String> {
        None
    }

    /// Execute the tool.  A structured failure should be returned as a JSON
    /// value with an `error` field; `Err` is reserved for infrastructure
    /// failures (the dispatcher converts both into error tool-responses).
    async fn execute(&self, args: Value) -> anyhow::Result<Value>;
}

/// Spoken-style fallback line for the user-visible start event, used when
/// the model did not supply a `userMessage` argument.
pub fn voice_line(tool_name: &str) -> String {
    match tool_name.to_lowercase().as_str() {
        "searchinternet" => "Searching the internet...".into(),
        "searchnews" => "Checking the latest news...".into(),
        "weather" => "Looking up the weather...".into(),
        "readwebpage" => "Reading that page...".into(),
        "memorylookup" => "Thinking back...".into(),
        "endpulse" => "Wrapping up...".into(),
        other => format!("Running {other}..."),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn definition_defaults() {
        let d = ToolDefinition::new("T", "desc", json!({"type": "object"}));
        assert_eq!(d.category, ToolCategory::General);
        assert_eq!(d.cost, 10);
        assert_eq!(d.timeout, Duration::from_secs(120));
        assert!(!d.hide_execution);
        assert!(d.icon.is_none());
    }

    #[test]
    fn effective_cost_floors_at_one() {
        let d = ToolDefinition::new("T", "d", json!({})).with_cost(0);
        assert_eq!(d.effective_cost(), 1);
    }

    #[test]
    fn builder_methods_apply() {
        let d = ToolDefinition::new("T", "d", json!({}))
            .with_category(ToolCategory::Pulse)
            .with_cost(3)
            .with_timeout(Duration::from_secs(5))
            .hidden()
            .with_icon("bolt");
        assert_eq!(d.category, ToolCategory::Pulse);
        assert_eq!(d.cost, 3);
        assert_eq!(d.timeout, Duration::from_secs(5));
        assert!(d.hide_execution);
        assert_eq!(d.icon.as_deref(), Some("bolt"));
    }

    #[test]
    fn voice_line_known_and_fallback() {
        assert_eq!(voice_line("Weather"), "Looking up the weather...");
        assert_eq!(voice_line("CustomTool"), "Running customtool...");
    }
}
