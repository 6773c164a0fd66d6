// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Named model endpoints.  The executor references these by key via
    /// `executor.primary_model` / `executor.tool_loop_model`.
    ///
    /// ```yaml
    /// endpoints:
    ///   primary:
    ///     base_url: https://api.openai.com/v1
    ///     model: gpt-4o
    ///     api_key_env: OPENAI_API_KEY
    ///   loop:
    ///     base_url: http://localhost:11434/v1
    ///     model: llama3.2
    /// ```
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
    /// Entity definitions keyed by entity id.
    #[serde(default)]
    pub entities: HashMap<String, EntityConfig>,
}

/// How hard the model should reason on a given call.
///
/// Forwarded verbatim to providers that accept a `reasoning_effort` request
/// field; ignored by providers that do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// How a request entered the system.
///
/// `Pulse` wakes are autonomous (no user present) and run under relaxed
/// rules: the planning gate is skipped and pulse-category tools become
/// available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationType {
    #[default]
    Chat,
    Pulse,
}

fn default_primary_model() -> String {
    "primary".into()
}
fn default_turn_window() -> usize {
    constants::DEFAULT_TURN_WINDOW
}
fn default_keep_recent() -> usize {
    constants::COMPRESSION_KEEP_RECENT
}
fn default_compression_threshold() -> f64 {
    constants::CONTEXT_COMPRESSION_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Endpoint key of the synthesis model (produces the final user-facing
    /// text).
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    /// Endpoint key of the cheap executor model that drives the tool loop.
    /// When unset the single-model fallback path is used: one round of
    /// tools, then a re-prompt of the primary model.
    #[serde(default)]
    pub tool_loop_model: Option<String>,
    /// Reasoning effort for primary-model calls.  The executor loop always
    /// runs at `low` regardless; synthesis falls back to `medium` when this
    /// is unset.
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Conversation turns kept when slicing inbound history.
    #[serde(default = "default_turn_window")]
    pub turn_window: usize,
    /// Messages preserved verbatim at the tail during window compression.
    #[serde(default = "default_keep_recent")]
    pub compression_keep_recent: usize,
    /// Fraction of the prompt window at which window compression runs.
    #[serde(default = "default_compression_threshold")]
    pub context_compression_threshold: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            primary_model: default_primary_model(),
            tool_loop_model: None,
            reasoning_effort: None,
            turn_window: default_turn_window(),
            compression_keep_recent: default_keep_recent(),
            context_compression_threshold: default_compression_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// API base that ends before `/chat/completions`, e.g.
    /// `https://api.openai.com/v1`.
    pub base_url: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid
    /// secrets in version-controlled files.
    pub api_key: Option<String>,
    /// Prompt-token ceiling override.  Unset falls back to
    /// [`constants::DEFAULT_MODEL_CONTEXT_LIMIT`].
    pub max_prompt_tokens: Option<usize>,
}

impl EndpointConfig {
    /// Resolve the API key: explicit value first (with `$VAR` / `~`
    /// expansion), then the named environment variable.  `None` means the
    /// endpoint is unauthenticated (local servers).
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(shellexpand::full(key).map(|s| s.into_owned()).unwrap_or_else(|_| key.clone()));
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

/// A servable entity: the tool surface and standing instructions one
/// conversational identity runs with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Tool names this entity may call.  `"*"` expands to every registered
    /// non-system tool; system tools must be listed explicitly.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Standing instructions prepended to the system prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_config_defaults() {
        let c = ExecutorConfig::default();
        assert_eq!(c.primary_model, "primary");
        assert!(c.tool_loop_model.is_none());
        assert!(c.reasoning_effort.is_none());
        assert_eq!(c.turn_window, 10);
        assert_eq!(c.compression_keep_recent, 6);
        assert!((c.context_compression_threshold - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn invocation_type_default_is_chat() {
        assert_eq!(InvocationType::default(), InvocationType::Chat);
    }

    #[test]
    fn reasoning_effort_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&ReasoningEffort::Low).unwrap(),
            "\"low\""
        );
        assert_eq!(
            serde_json::to_string(&ReasoningEffort::Medium).unwrap(),
            "\"medium\""
        );
    }

    #[test]
    fn config_deserialises_from_yaml() {
        let yaml = r#"
executor:
  primary_model: primary
  tool_loop_model: loop
  reasoning_effort: high
endpoints:
  primary:
    base_url: https://api.openai.com/v1
    model: gpt-4o
    api_key_env: OPENAI_API_KEY
  loop:
    base_url: http://localhost:11434/v1
    model: llama3.2
entities:
  weather-bot:
    id: weather-bot
    name: Weather Bot
    tools: ["Weather", "SearchInternet"]
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.executor.tool_loop_model.as_deref(), Some("loop"));
        assert_eq!(c.executor.reasoning_effort, Some(ReasoningEffort::High));
        assert_eq!(c.endpoints.len(), 2);
        assert_eq!(c.entities["weather-bot"].tools.len(), 2);
    }

    #[test]
    fn endpoint_resolve_api_key_prefers_explicit_value() {
        let e = EndpointConfig {
            base_url: "http://localhost".into(),
            model: "m".into(),
            api_key_env: Some("SYNAPSE_TEST_KEY_UNSET".into()),
            api_key: Some("sk-explicit".into()),
            max_prompt_tokens: None,
        };
        assert_eq!(e.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn endpoint_resolve_api_key_none_when_unset() {
        let e = EndpointConfig {
            base_url: "http://localhost".into(),
            model: "m".into(),
            api_key_env: None,
            api_key: None,
            max_prompt_tokens: None,
        };
        assert!(e.resolve_api_key().is_none());
    }

    #[test]
    fn entity_config_tools_default_empty() {
        let e: EntityConfig = serde_yaml::from_str("id: x").unwrap();
        assert!(e.tools.is_empty());
        assert!(e.instructions.is_none());
    }
}
