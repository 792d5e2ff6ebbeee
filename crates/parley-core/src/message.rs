//! Finalized conversation messages.
//!
//! A [`Message`] is one turn of a conversation. It is always fully
//! materialized: streaming state lives in
//! [`AccumulatedState`](crate::accumulate::AccumulatedState) until the
//! message is finalized.

use serde::{Deserialize, Serialize};

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions injected ahead of the conversation.
    System,
    /// A human turn.
    User,
    /// A model turn.
    Assistant,
    /// The result of a tool call.
    Tool,
}

impl Role {
    /// Return the lowercase wire name of this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Raw image bytes (PNG, JPEG, GIF or WebP).
    Image {
        /// Encoded image bytes; base64 when serialized.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// A tool call requested by the model.
    Function {
        /// Provider-assigned call id, echoed back on the tool result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Name of the tool to invoke.
        name: String,
        /// JSON-encoded arguments.
        arguments: String,
    },
    /// Structured JSON content.
    Value {
        /// The JSON value.
        value: serde_json::Value,
    },
}

impl Part {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image part.
    #[must_use]
    pub fn image(data: Vec<u8>) -> Self {
        Self::Image { data }
    }

    /// Return the text if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Return the kind name used in the serialized tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Function { .. } => "function",
            Self::Value { .. } => "value",
        }
    }
}

/// A finalized conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// Tool-call id this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Reasoning text emitted before the answer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Ordered content parts.
    #[serde(default)]
    pub contents: Vec<Part>,

    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Part>,
}

impl Message {
    /// Create a message with the given role and parts.
    #[must_use]
    pub fn new(role: Role, contents: Vec<Part>) -> Self {
        Self {
            role,
            id: None,
            thinking: None,
            contents,
            tool_calls: Vec::new(),
        }
    }

    /// Create a single-text-part system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    /// Create a single-text-part user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Create a single-text-part assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    /// Create a tool result message answering the call `call_id`.
    #[must_use]
    pub fn tool_result(call_id: Option<String>, contents: Vec<Part>) -> Self {
        Self {
            id: call_id,
            ..Self::new(Role::Tool, contents)
        }
    }

    /// Return the concatenation of every text part.
    #[must_use]
    pub fn text(&self) -> String {
        self.contents.iter().filter_map(Part::as_text).collect()
    }

    /// Return the first text part, if the message has one.
    #[must_use]
    pub fn first_text(&self) -> Option<&str> {
        self.contents.iter().find_map(Part::as_text)
    }
}

/// Serde adapter storing bytes as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a base64 string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Deserialize bytes from a base64 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_json_shape() {
        let msg = Message::user("Hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "role": "user",
                "contents": [{ "type": "text", "text": "Hello" }]
            })
        );
    }

    #[test]
    fn image_bytes_are_base64_encoded() {
        let msg = Message::new(Role::User, vec![Part::text("look"), Part::image(vec![1, 2, 3])]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["contents"][1]["data"], "AQID");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn text_joins_all_text_parts() {
        let msg = Message::new(
            Role::Assistant,
            vec![Part::text("a"), Part::image(vec![0]), Part::text("b")],
        );
        assert_eq!(msg.text(), "ab");
        assert_eq!(msg.first_text(), Some("a"));
    }
}
