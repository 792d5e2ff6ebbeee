//! Incremental message fragments emitted by a run.

use serde::{Deserialize, Serialize};

use crate::message::{Part, Role};

/// An incremental update to one message part.
///
/// Text and function arguments carry the newly appended substring, not the
/// full value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartDelta {
    /// Appended text.
    Text {
        /// Text fragment.
        text: String,
    },
    /// A complete image.
    Image {
        /// Encoded image bytes.
        #[serde(with = "crate::message::base64_bytes")]
        data: Vec<u8>,
    },
    /// A tool call fragment.
    Function {
        /// Call id; present on the first fragment of a call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Tool name; present on the first fragment of a call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Appended JSON argument text.
        #[serde(default)]
        arguments: String,
    },
    /// A complete JSON value.
    Value {
        /// The JSON value.
        value: serde_json::Value,
    },
}

impl PartDelta {
    /// Create a text fragment.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
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

    /// Convert into a fresh part, as if no prior part existed.
    #[must_use]
    pub fn into_part(self) -> Part {
        match self {
            Self::Text { text } => Part::Text { text },
            Self::Image { data } => Part::Image { data },
            Self::Function {
                id,
                name,
                arguments,
            } => Part::Function {
                id,
                name: name.unwrap_or_default(),
                arguments,
            },
            Self::Value { value } => Part::Value { value },
        }
    }
}

impl From<Part> for PartDelta {
    fn from(part: Part) -> Self {
        match part {
            Part::Text { text } => Self::Text { text },
            Part::Image { data } => Self::Image { data },
            Part::Function {
                id,
                name,
                arguments,
            } => Self::Function {
                id,
                name: Some(name),
                arguments,
            },
            Part::Value { value } => Self::Value { value },
        }
    }
}

/// A partial message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    /// Role, usually only on the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Tool-call id for tool result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Appended reasoning text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Content fragments in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<PartDelta>,

    /// Tool call fragments in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<PartDelta>,
}

impl MessageDelta {
    /// Create a delta carrying a role and one text fragment.
    #[must_use]
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            contents: vec![PartDelta::text(text)],
            ..Self::default()
        }
    }

    /// Return true if the delta carries no payload at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.id.is_none()
            && self.thinking.is_none()
            && self.contents.is_empty()
            && self.tool_calls.is_empty()
    }
}

impl From<crate::message::Message> for MessageDelta {
    /// A complete message expressed as a single delta.
    fn from(message: crate::message::Message) -> Self {
        Self {
            role: Some(message.role),
            id: message.id,
            thinking: message.thinking,
            contents: message.contents.into_iter().map(PartDelta::from).collect(),
            tool_calls: message.tool_calls.into_iter().map(PartDelta::from).collect(),
        }
    }
}

/// Why a message stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the message.
    Stop,
    /// Token limit reached.
    Length,
    /// The model requested tool calls.
    ToolCall,
    /// The provider refused to answer.
    Refusal {
        /// Provider-supplied explanation.
        reason: String,
    },
}

/// One item of a run's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaOutput {
    /// The fragment.
    pub delta: MessageDelta,

    /// Set on the last fragment of a message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl MessageDeltaOutput {
    /// A fragment that does not end the message.
    #[must_use]
    pub const fn partial(delta: MessageDelta) -> Self {
        Self {
            delta,
            finish_reason: None,
        }
    }

    /// A fragment that ends the message.
    #[must_use]
    pub const fn finished(delta: MessageDelta, reason: FinishReason) -> Self {
        Self {
            delta,
            finish_reason: Some(reason),
        }
    }

    /// Return true if this fragment ends the message.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}
