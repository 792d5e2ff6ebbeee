//! Agent session state.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent session.
///
/// ```text
/// Uninitialized ──► Provisioning ──► Ready
///                     ▲   │  ▲        │
///                     │   ▼  └────────┘ (reconfigured)
///                     └─ Error
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No model has been requested yet.
    #[default]
    Uninitialized,
    /// A model is being downloaded, loaded or bound.
    Provisioning,
    /// A model is bound and runs are accepted.
    Ready,
    /// The last provisioning attempt failed.
    Error,
}

impl SessionState {
    /// Return true if runs and tool changes are accepted.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Return the snake_case name of this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
