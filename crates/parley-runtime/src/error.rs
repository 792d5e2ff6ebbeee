//! Error types for the chat runtime.
//!
//! Worker `error` events are translated into [`RuntimeError`] values by
//! their scope; everything the foreground rejects itself is a
//! [`RunPreconditionError`] or a configuration error.

use parley_core::{ProtocolError, SessionState};
use parley_engine::EngineError;
use parley_store::StoreError;
use parley_worker::WorkerError;
use thiserror::Error;

/// A result type using `RuntimeError`.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Why a turn could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunPreconditionError {
    /// No model is bound.
    #[error("agent is not ready (session is {0})")]
    NotReady(SessionState),

    /// A run is already streaming.
    #[error("a run is already active")]
    RunActive,

    /// There is nothing to run over.
    #[error("run history is empty")]
    EmptyHistory,

    /// The turn's content cannot be sent to the model.
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),
}

/// Errors that can occur in the chat runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The delta stream broke an accumulation rule.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Provisioning the selected model failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// A turn could not be started.
    #[error(transparent)]
    RunPrecondition(#[from] RunPreconditionError),

    /// The worker refused to start a run.
    #[error("run rejected: {0}")]
    RunRejected(String),

    /// An active run failed.
    #[error("run failed: {0}")]
    Run(String),

    /// Registering an external tool server failed.
    #[error("external server {url}: {message}")]
    ExternalServer {
        /// Server URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// The worker rejected a tool change.
    #[error("tool error: {0}")]
    Tool(String),

    /// The worker rejected a command.
    #[error("command rejected: {0}")]
    Command(String),

    /// The worker channel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The model is not in the catalog.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// A local model was selected before its weights were downloaded.
    #[error("model {0} has not been downloaded")]
    ModelNotDownloaded(String),

    /// The tool is not offered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// No external server is registered at this URL.
    #[error("unknown external server: {0}")]
    UnknownServer(String),

    /// No thread is selected.
    #[error("no thread selected")]
    NoThread,

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Worker channel error.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Local model server error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl RuntimeError {
    /// Returns true if the error ends the active run.
    #[must_use]
    pub const fn ends_run(&self) -> bool {
        matches!(self, Self::RunRejected(_) | Self::Run(_) | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_errors_display() {
        let err = RuntimeError::from(RunPreconditionError::NotReady(SessionState::Provisioning));
        assert_eq!(err.to_string(), "agent is not ready (session is provisioning)");
        assert_eq!(
            RunPreconditionError::UnsupportedContent("image first".into()).to_string(),
            "unsupported content: image first"
        );
    }

    #[test]
    fn run_ending_errors() {
        assert!(RuntimeError::Run("boom".into()).ends_run());
        assert!(RuntimeError::Protocol(ProtocolError::MissingRole).ends_run());
        assert!(!RuntimeError::Tool("x".into()).ends_run());
    }
}
