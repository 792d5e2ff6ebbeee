//! Tool descriptors and registration keys.

use serde::{Deserialize, Serialize};

/// Describes a callable tool to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDesc {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON schema of the arguments object.
    #[serde(default = "ToolDesc::empty_parameters", alias = "inputSchema")]
    pub parameters: serde_json::Value,
}

impl ToolDesc {
    /// Create a descriptor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            parameters,
        }
    }

    fn empty_parameters() -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
}

/// Identifies a registered tool within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKey {
    /// A built-in capability.
    Builtin(String),
    /// A tool exposed by the external tool server at `url`.
    External {
        /// Server URL.
        url: String,
        /// Tool name on that server.
        name: String,
    },
}

impl ToolKey {
    /// Build a key from a tool name and the server it came from, if any.
    #[must_use]
    pub fn new(name: impl Into<String>, url: Option<String>) -> Self {
        match url {
            Some(url) => Self::External {
                url,
                name: name.into(),
            },
            None => Self::Builtin(name.into()),
        }
    }

    /// Return the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(name) | Self::External { name, .. } => name,
        }
    }

    /// Return the server URL for external tools.
    #[must_use]
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Builtin(_) => None,
            Self::External { url, .. } => Some(url),
        }
    }
}

impl std::fmt::Display for ToolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(name) => write!(f, "builtin:{name}"),
            Self::External { url, name } => write!(f, "{url}#{name}"),
        }
    }
}
