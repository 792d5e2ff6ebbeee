//! The session's registered tools.

use std::sync::Arc;

use parley_core::ToolKey;
use parley_engine::Tool;

use crate::error::{Result, WorkerError};

/// Tools registered with the current session, in registration order.
///
/// Models see tools by bare name, so names are unique across the set no
/// matter which server a tool came from.
#[derive(Default)]
pub struct ToolSet {
    entries: Vec<(ToolKey, Arc<dyn Tool>)>,
}

impl ToolSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` under `key`, replacing a previous registration in place.
    /// Returns true if the key was new.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::DuplicateToolName` if a tool under another key
    /// already has the same name.
    pub fn insert(&mut self, key: ToolKey, tool: Arc<dyn Tool>) -> Result<bool> {
        if let Some((existing, _)) = self
            .entries
            .iter()
            .find(|(k, _)| *k != key && k.name() == key.name())
        {
            return Err(WorkerError::DuplicateToolName {
                name: key.name().to_string(),
                existing: existing.to_string(),
            });
        }

        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = tool;
            Ok(false)
        } else {
            self.entries.push((key, tool));
            Ok(true)
        }
    }

    /// Unregister `key`. Returns true if it was registered.
    pub fn remove(&mut self, key: &ToolKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    /// Unregister every tool of the server at `url`. Returns how many were
    /// removed.
    pub fn remove_server(&mut self, url: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k.server() != Some(url));
        before - self.entries.len()
    }

    /// Unregister everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Registered tool names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.name()).collect()
    }

    /// Registered tools in order, as handed to a run.
    #[must_use]
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.entries.iter().map(|(_, t)| Arc::clone(t)).collect()
    }
}
