//! Domain types stored in the database.

use chrono::{DateTime, Utc};
use parley_core::{Message, Role, ThreadId, ToolDesc};
use serde::{Deserialize, Serialize};

/// Title given to threads before their first message.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Maximum number of characters in an automatic title.
pub const AUTO_TITLE_CHARS: usize = 30;

/// A conversation record. Messages are stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// Unique identifier for the thread.
    pub thread_id: ThreadId,
    /// Display title.
    pub title: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Number of finalized messages.
    pub message_count: u32,
}

impl Thread {
    /// Create an empty thread.
    #[must_use]
    pub fn new(title: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: ThreadId::generate(),
            title: title.unwrap_or(DEFAULT_TITLE).to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

/// Derive a thread title from its first message.
///
/// Only user messages with text produce a title. The title is the first
/// [`AUTO_TITLE_CHARS`] characters of the first text part.
#[must_use]
pub fn auto_title(message: &Message) -> Option<String> {
    if message.role != Role::User {
        return None;
    }
    message
        .first_text()
        .map(|text| text.chars().take(AUTO_TITLE_CHARS).collect())
}

/// A registered external tool server as persisted in settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalServerRecord {
    /// Server URL; the registration key.
    pub url: String,
    /// Tools discovered at the last successful registration.
    #[serde(default)]
    pub tools: Vec<ToolDesc>,
    /// Names of the tools the user selected.
    #[serde(default)]
    pub selected: Vec<String>,
}

impl ExternalServerRecord {
    /// Create a record with no discovered tools.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tools: Vec::new(),
            selected: Vec::new(),
        }
    }

    /// Return true if `name` is selected.
    #[must_use]
    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.iter().any(|s| s == name)
    }
}
