//! Messages, parts, and tool calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions, e.g. the leading anchor message.
    System,
    /// User turn.
    User,
    /// Assistant turn.
    Assistant,
    /// Tool result turn.
    Tool,
}

/// A part of a message's content.
///
/// Today only `Text` is semantically processed, but the schema permits
/// additional part kinds. [`Part`] round-trips unknown kinds byte-for-byte
/// through [`Part::Other`] rather than discarding them.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    /// Plain text content.
    Text {
        /// The text.
        text: String,
    },
    /// A part kind this build doesn't understand. Preserved verbatim.
    Other {
        /// The part's `type` tag.
        kind: String,
        /// The full JSON object, including `type`.
        value: Value,
    },
}

impl Part {
    /// Construct a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The text content, if this part is textual.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Other { .. } => None,
        }
    }
}

impl Serialize for Part {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Text { text } => {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::String("text".into()));
                obj.insert("text".into(), Value::String(text.clone()));
                Value::Object(obj).serialize(serializer)
            },
            Self::Other { value, .. } => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if kind == "text" {
            if let Some(text) = value.get("text").and_then(Value::as_str) {
                return Ok(Self::Text {
                    text: text.to_string(),
                });
            }
        }

        Ok(Self::Other { kind, value })
    }
}

/// Result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Content fed back to the model.
    pub llm_content: String,
    /// Optional content shown to the user instead of `llm_content`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub return_display: Option<String>,
}

impl ToolCallResult {
    /// Create a result with no separate display text.
    pub fn new(llm_content: impl Into<String>) -> Self {
        Self {
            llm_content: llm_content.into(),
            return_display: None,
        }
    }
}

/// A single tool invocation recorded in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// UUIDv4 identifying this call.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool arguments, opaque to the core except for loop-detection equality.
    pub args: Value,
    /// The tool's result.
    pub result: ToolCallResult,
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    /// Construct a new tool call with a fresh UUIDv4 id.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Value, result: ToolCallResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            args,
            result,
            timestamp: Utc::now(),
        }
    }

    /// The canonical fingerprint used for loop-detection equality:
    /// `(name, canonical-JSON(args))` with object keys sorted alphabetically.
    #[must_use]
    pub fn fingerprint(&self) -> (String, String) {
        (self.name.clone(), canonical_json(&self.args))
    }
}

/// Render `value` as JSON with object keys sorted alphabetically at every
/// level, so structurally-equal-but-differently-ordered objects fingerprint
/// identically.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), canonicalize(v));
                }
                Value::Object(out)
            },
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message.
    pub role: MessageRole,
    /// Ordered content parts.
    pub parts: Vec<Part>,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Construct a message from a single text part.
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::text(text)],
            timestamp: Utc::now(),
        }
    }

    /// Construct a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    /// Construct an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, text)
    }

    /// Construct a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    /// Concatenate the text of every [`Part::Text`] part, in order.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_part_round_trips() {
        let part = Part::text("hello");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hello"}));
        let back: Part = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn unknown_part_kind_round_trips_verbatim() {
        let raw = serde_json::json!({"type": "image", "data": "base64", "mime": "image/png"});
        let part: Part = serde_json::from_value(raw.clone()).unwrap();
        match &part {
            Part::Other { kind, .. } => assert_eq!(kind, "image"),
            Part::Text { .. } => panic!("expected Other"),
        }
        let back = serde_json::to_value(&part).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = ToolCall::new(
            "read_file",
            serde_json::json!({"path": "/t.txt", "limit": 10}),
            ToolCallResult::new("ok"),
        );
        let b = ToolCall::new(
            "read_file",
            serde_json::json!({"limit": 10, "path": "/t.txt"}),
            ToolCallResult::new("ok"),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_args() {
        let a = ToolCall::new(
            "read_file",
            serde_json::json!({"path": "/t.txt"}),
            ToolCallResult::new("ok"),
        );
        let b = ToolCall::new(
            "read_file",
            serde_json::json!({"path": "/other.txt"}),
            ToolCallResult::new("ok"),
        );
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn message_text_content_joins_parts() {
        let mut msg = Message::user("hello ");
        msg.parts.push(Part::text("world"));
        assert_eq!(msg.text_content(), "hello world");
    }
}
