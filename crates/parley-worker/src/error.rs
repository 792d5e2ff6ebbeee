//! Error types for the worker.
//!
//! Inside the worker every error is reported as an `error` event; these
//! values never cross the channel themselves.

use parley_core::SessionState;
use parley_engine::EngineError;
use thiserror::Error;

/// A result type using `WorkerError`.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that can occur while driving the agent worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The other end of the channel is gone.
    #[error("worker channel closed")]
    ChannelClosed,

    /// The worker thread could not be started.
    #[error("failed to start worker: {0}")]
    Spawn(String),

    /// A frame could not be encoded or decoded.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested state transition is not valid.
    #[error("cannot transition session from {from} to {to}")]
    InvalidTransition {
        /// The current state.
        from: SessionState,
        /// The requested target state.
        to: SessionState,
    },

    /// The session has no usable model.
    #[error("agent is not ready (session is {0})")]
    NotReady(SessionState),

    /// A run is already streaming.
    #[error("a run is already active")]
    RunActive,

    /// A run was requested with no messages.
    #[error("run history is empty")]
    EmptyHistory,

    /// No external server is registered at this URL.
    #[error("unknown external server: {0}")]
    UnknownServer(String),

    /// No tool with this name is registered or offered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Another registered tool already uses this name.
    #[error("tool name {name} is already taken by {existing}")]
    DuplicateToolName {
        /// The requested tool name.
        name: String,
        /// The tool holding the name.
        existing: String,
    },

    /// A command carried an inconsistent payload.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// An engine operation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl WorkerError {
    /// Returns true if the error rejects a run request.
    #[must_use]
    pub const fn is_run_rejection(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::RunActive | Self::EmptyHistory)
    }
}
