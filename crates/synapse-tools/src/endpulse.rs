// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCategory, ToolDefinition};

/// Pulse-only tool the entity calls to close an autonomous wake.
///
/// The reflection text is echoed back so the executor can break the loop and
/// the synthesis turn can narrate what the pulse accomplished.
pub struct EndPulseTool {
    def: ToolDefinition,
}

impl Default for EndPulseTool {
    fn default() -> Self {
        Self {
            def: ToolDefinition::new(
                "EndPulse",
                "End the current autonomous pulse. Call this when the pulse's \
                 work is done, with a short reflection on what happened.",
                json!({
                    "type": "object",
                    "properties": {
                        "reflection": {
                            "type": "string",
                            "description": "One or two sentences on what this pulse accomplished."
                        }
                    },
                    "required": ["reflection"]
                }),
            )
            .with_category(ToolCategory::Pulse)
            .with_cost(1),
        }
    }
}

#[async_trait]
impl Tool for EndPulseTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let reflection = args["reflection"].as_str().unwrap_or_default();
        Ok(json!({ "status": "pulse ended", "reflection": reflection }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
