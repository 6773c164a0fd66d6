// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use synapse_config::{EntityConfig, InvocationType};

use crate::{Tool, ToolCategory};

/// A tool schema; mirrors synapse_model::ToolSchema but keeps the tools
/// crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The resolved tool surface of one entity for one invocation.
///
/// `tools` is keyed by lowercase tool name (the dispatcher matches names
/// case-insensitively); `schemas` is the same set in declaration form for
/// the model request, sorted by name.
pub struct EntityTools {
    tools: HashMap<String, Arc<dyn Tool>>,
    schemas: Vec<ToolSchema>,
}

impl EntityTools {
    pub fn empty() -> Self {
        Self { tools: HashMap::new(), schemas: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name.to_lowercase()).cloned()
    }

    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

/// Central registry holding every tool the serving layer knows about.
/// Entity configs select a subset per request via [`tools_for_entity`].
///
/// [`tools_for_entity`]: ToolRegistry::tools_for_entity
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools
            .insert(tool.definition().name.to_lowercase(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name.to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .map(|t| t.definition().name.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolve the tool surface for an entity.
    ///
    /// - `"*"` in the entity list expands to every `General` tool; `System`
    ///   tools are only included when listed explicitly by name.
    /// - `Pulse` tools are included only for pulse invocations, and then
    ///   they are injected whether or not the entity lists them.
    pub fn tools_for_entity(
        &self,
        entity: &EntityConfig,
        invocation: InvocationType,
    ) -> EntityTools {
        let mut selected: HashMap<String, Arc<dyn Tool>> = HashMap::new();

        let wildcard = entity.tools.iter().any(|t| t == "*");
        if wildcard {
            for (key, tool) in &self.tools {
                if tool.definition().category == ToolCategory::General {
                    selected.insert(key.clone(), Arc::clone(tool));
                }
            }
        }

        for name in &entity.tools {
            if name == "*" {
                continue;
            }
            let key = name.to_lowercase();
            if let Some(tool) = self.tools.get(&key) {
                match tool.definition().category {
                    // Explicit listing admits system tools.
                    ToolCategory::General | ToolCategory::System => {
                        selected.insert(key, Arc::clone(tool));
                    }
                    // Pulse tools exist only during pulse wakes.
                    ToolCategory::Pulse => {
                        if invocation == InvocationType::Pulse {
                            selected.insert(key, Arc::clone(tool));
                        }
                    }
                }
            }
        }

        if invocation == InvocationType::Pulse {
            for (key, tool) in &self.tools {
                if tool.definition().category == ToolCategory::Pulse {
                    selected.insert(key.clone(), Arc::clone(tool));
                }
            }
        }

        let mut schemas: Vec<ToolSchema> = selected
            .values()
            .map(|t| {
                let d = t.definition();
                ToolSchema {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    parameters: d.parameters.clone(),
                }
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));

        EntityTools { tools: selected, schemas }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::ToolDefinition;

    struct StaticTool {
        def: ToolDefinition,
    }

    impl StaticTool {
        fn new(name: &str, category: ToolCategory) -> Self {
            Self {
                def: ToolDefinition::new(name, "test tool", json!({"type": "object"}))
                    .with_category(category),
            }
        }
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
            Ok(json!({"ok": true}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(StaticTool::new("Weather", ToolCategory::General));
        reg.register(StaticTool::new("SearchNews", ToolCategory::General));
        reg.register(StaticTool::new("AdminReset", ToolCategory::System));
        reg.register(StaticTool::new("EndPulse", ToolCategory::Pulse));
        reg
    }

    fn entity(tools: &[&str]) -> EntityConfig {
        EntityConfig {
            id: "e1".into(),
            name: "Test".into(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            instructions: None,
        }
    }

    #[test]
    fn register_and_get_is_case_insensitive() {
        let reg = registry();
        assert!(reg.get("weather").is_some());
        assert!(reg.get("WEATHER").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn explicit_list_selects_named_tools() {
        let reg = registry();
        let et = reg.tools_for_entity(&entity(&["Weather"]), InvocationType::Chat);
        assert_eq!(et.len(), 1);
        assert!(et.get("weather").is_some());
        assert!(et.get("searchnews").is_none());
    }

    #[test]
    fn wildcard_excludes_system_tools() {
        let reg = registry();
        let et = reg.tools_for_entity(&entity(&["*"]), InvocationType::Chat);
        assert!(et.get("weather").is_some());
        assert!(et.get("searchnews").is_some());
        assert!(et.get("adminreset").is_none(), "system tools need explicit listing");
    }

    #[test]
    fn system_tool_included_when_listed_explicitly() {
        let reg = registry();
        let et = reg.tools_for_entity(&entity(&["*", "AdminReset"]), InvocationType::Chat);
        assert!(et.get("adminreset").is_some());
    }

    #[test]
    fn pulse_tools_absent_from_chat() {
        let reg = registry();
        let et = reg.tools_for_entity(&entity(&["*", "EndPulse"]), InvocationType::Chat);
        assert!(et.get("endpulse").is_none());
    }

    #[test]
    fn pulse_tools_auto_injected_on_pulse() {
        let reg = registry();
        // EndPulse not in the entity list at all.
        let et = reg.tools_for_entity(&entity(&["Weather"]), InvocationType::Pulse);
        assert!(et.get("endpulse").is_some());
    }

    #[test]
    fn schemas_sorted_by_name() {
        let reg = registry();
        let et = reg.tools_for_entity(&entity(&["*"]), InvocationType::Chat);
        let names: Vec<&str> = et.schemas().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["SearchNews", "Weather"]);
    }
}
