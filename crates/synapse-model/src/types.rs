use serde::{Deserialize, Serialize};
use serde_json::Value;

use synapse_config::constants::{
    IMAGE_TOKEN_ESTIMATE, MESSAGE_TOKEN_OVERHEAD, TOOL_CALL_TOKEN_OVERHEAD,
};
use synapse_config::ReasoningEffort;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Used for user messages that mix text with image references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        image_url: String,
    },
}

impl ContentPart {
    /// Convenience constructor for a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for an image part.
    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into() }
    }
}

/// The content of a message: a simple string for most messages, or ordered
/// parts for multimodal user turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text.  Image parts are omitted.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

// ─── Tool call records ────────────────────────────────────────────────────────

/// One tool invocation requested by the model.
///
/// `arguments` is the raw JSON string exactly as the model emitted it;
/// parsing is deferred to the dispatcher so malformed arguments surface as a
/// tool-level error rather than a dropped call.  `thought_signature` is an
/// opaque plugin field echoed back verbatim on the next turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl ToolCallRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            thought_signature: None,
        }
    }

    /// Build a record from a loosely-shaped JSON value.
    ///
    /// Accepts the flat form `{id, name, arguments}` and the OpenAI wire
    /// form `{id, function: {name, arguments}}`.  Returns `None` when the
    /// value carries no usable name.
    pub fn from_value(v: &Value) -> Option<Self> {
        let id = v["id"].as_str().unwrap_or_default().to_string();
        let (name, arguments) = if let Some(f) = v.get("function") {
            (
                f["name"].as_str()?.to_string(),
                f["arguments"].as_str().unwrap_or("{}").to_string(),
            )
        } else {
            (
                v["name"].as_str()?.to_string(),
                v["arguments"].as_str().unwrap_or("{}").to_string(),
            )
        };
        if name.is_empty() {
            return None;
        }
        let thought_signature = v["thoughtSignature"]
            .as_str()
            .or_else(|| v["thought_signature"].as_str())
            .map(str::to_string);
        Some(Self { id, name, arguments, thought_signature })
    }
}

/// Normalize a transport-shaped `tool_calls` value into typed records.
///
/// Some transports serialize each element as a JSON *string* instead of an
/// object; both forms are accepted.  Elements with no usable name are
/// dropped.
pub fn normalize_tool_calls(raw: &Value) -> Vec<ToolCallRecord> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .as_ref()
                .and_then(ToolCallRecord::from_value),
            other => ToolCallRecord::from_value(other),
        })
        .collect()
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.
///
/// `tool_calls` is populated only on assistant messages; a tool-response
/// message carries the `tool_call_id` it answers plus the tool `name`
/// (providers with positional function-response protocols rely on the
/// explicit name rather than an id prefix).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// User message from a list of content parts (text + images).
    /// A single text part collapses to `MessageContent::Text`.
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Parts(parts)
            }
        } else {
            MessageContent::Parts(parts)
        };
        Self {
            role: Role::User,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message carrying every tool call of one round.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool-response message answering exactly one assistant tool call.
    pub fn tool_response(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    /// The plain text of this message, if its content is a single text block.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Token estimate used for context-window decisions.
    ///
    /// 4 tokens of per-message overhead, plus the encoded length of textual
    /// content (images contribute a fixed 85 tokens each), plus
    /// 10 + encoded name/arguments per tool call.  The encoding is the
    /// 4-chars-per-token heuristic.
    pub fn estimate_tokens(&self) -> usize {
        let content_tokens = match &self.content {
            MessageContent::Text(t) => encoded_len(t),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => encoded_len(text),
                    ContentPart::Image { .. } => IMAGE_TOKEN_ESTIMATE,
                })
                .sum(),
        };
        let tool_call_tokens: usize = self
            .tool_calls
            .iter()
            .map(|tc| TOOL_CALL_TOKEN_OVERHEAD + encoded_len(&tc.name) + encoded_len(&tc.arguments))
            .sum();
        MESSAGE_TOKEN_OVERHEAD + content_tokens + tool_call_tokens
    }
}

fn encoded_len(s: &str) -> usize {
    s.len().div_ceil(4)
}

// ─── Request / response types ─────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// Request sent to a model plugin.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Replaces the endpoint's configured model name for this call.
    pub model_override: Option<String>,
}

/// Token usage from one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A complete (non-streaming) model result.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A fragment of a tool call; arguments may arrive across many deltas.
    /// `index` routes accumulation for parallel tool calls.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
        thought_signature: Option<String>,
    },
    /// Final usage statistics
    Usage { input_tokens: u32, output_tokens: u32 },
    /// The stream finished normally
    Done,
    /// A recoverable error surfaced inside the stream
    Error(String),
}

/// One parsed stream item plus the raw event JSON it came from.
///
/// The raw payload is fanned out verbatim to progress subscribers; mocks
/// that never touch a wire leave it `None`.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub event: ResponseEvent,
    pub raw: Option<String>,
}

impl StreamChunk {
    pub fn event(event: ResponseEvent) -> Self {
        Self { event, raw: None }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_tool_response_carries_id_and_name() {
        let m = Message::tool_response("call-1", "Weather", "Sunny");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(m.name.as_deref(), Some("Weather"));
        assert_eq!(m.as_text(), Some("Sunny"));
    }

    #[test]
    fn assistant_with_tool_calls_has_calls() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRecord::new("1", "Weather", "{}")],
        );
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_calls[0].name, "Weather");
    }

    #[test]
    fn user_with_single_text_part_collapses() {
        let m = Message::user_with_parts(vec![ContentPart::text("hi")]);
        assert_eq!(m.content, MessageContent::Text("hi".into()));
    }

    #[test]
    fn content_to_text_skips_images() {
        let c = MessageContent::Parts(vec![
            ContentPart::text("a"),
            ContentPart::image("data:image/png;base64,X"),
            ContentPart::text("b"),
        ]);
        assert_eq!(c.to_text(), "a\nb");
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    #[test]
    fn estimate_tokens_text_message() {
        // 4 overhead + ceil(8/4) = 6
        let m = Message::user("12345678");
        assert_eq!(m.estimate_tokens(), 6);
    }

    #[test]
    fn estimate_tokens_image_is_constant() {
        let m = Message::user_with_parts(vec![
            ContentPart::text("1234"),
            ContentPart::image("data:image/png;base64,AAAA"),
        ]);
        // 4 overhead + 1 text + 85 image
        assert_eq!(m.estimate_tokens(), 90);
    }

    #[test]
    fn estimate_tokens_tool_call_overhead() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRecord::new("1", "abcd", "12345678")],
        );
        // 4 msg overhead + 0 content + 10 + 1 (name) + 2 (args)
        assert_eq!(m.estimate_tokens(), 17);
    }

    // ── Tool-call normalization ───────────────────────────────────────────────

    #[test]
    fn normalize_accepts_openai_wire_form() {
        let raw = json!([{
            "id": "c1",
            "type": "function",
            "function": {"name": "Weather", "arguments": "{\"city\":\"Paris\"}"}
        }]);
        let calls = normalize_tool_calls(&raw);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Weather");
        assert_eq!(calls[0].arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn normalize_accepts_stringified_elements() {
        let raw = json!([
            "{\"id\":\"c1\",\"name\":\"Weather\",\"arguments\":\"{}\"}"
        ]);
        let calls = normalize_tool_calls(&raw);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
    }

    #[test]
    fn normalize_drops_nameless_elements() {
        let raw = json!([{"id": "c1"}, {"id": "c2", "name": "Ok", "arguments": "{}"}]);
        let calls = normalize_tool_calls(&raw);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Ok");
    }

    #[test]
    fn normalize_non_array_yields_empty() {
        assert!(normalize_tool_calls(&json!("nope")).is_empty());
        assert!(normalize_tool_calls(&json!(null)).is_empty());
    }

    #[test]
    fn from_value_preserves_thought_signature() {
        let v = json!({
            "id": "c1",
            "function": {"name": "f", "arguments": "{}"},
            "thoughtSignature": "sig-abc"
        });
        let tc = ToolCallRecord::from_value(&v).unwrap();
        assert_eq!(tc.thought_signature.as_deref(), Some("sig-abc"));
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::assistant_with_tool_calls(
            "checking",
            vec![ToolCallRecord::new("c1", "Weather", "{\"city\":\"Oslo\"}")],
        );
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn plain_message_omits_tool_fields() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }

    #[test]
    fn usage_accumulates() {
        let mut u = Usage { input_tokens: 10, output_tokens: 5 };
        u.accumulate(Usage { input_tokens: 3, output_tokens: 2 });
        assert_eq!(u, Usage { input_tokens: 13, output_tokens: 7 });
    }
}
