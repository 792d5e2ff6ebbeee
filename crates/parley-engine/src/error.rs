//! Error types for the engine crate.

use parley_core::{ApiSpec, ProtocolError};
use thiserror::Error;

/// Errors that can occur while provisioning models, streaming runs or
/// calling tools.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No credential is configured for the provider.
    #[error("no API key configured for {0}")]
    MissingCredential(ApiSpec),

    /// The provider rejected the credential.
    #[error("API key rejected by {0}")]
    InvalidCredential(ApiSpec),

    /// The local model server is unreachable or cannot serve models.
    #[error("local models unavailable: {0}")]
    LocalUnavailable(String),

    /// Downloading model weights failed.
    #[error("model download failed: {0}")]
    ModelDownload(String),

    /// A network request failed before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// A provider answered with an error status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The response stream broke or could not be decoded.
    #[error("stream error: {0}")]
    Stream(String),

    /// The provider's deltas violated the message protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An external tool server failed to register or answer.
    #[error("tool server {url}: {message}")]
    ToolServer {
        /// Server URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// No tool with this name exists.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A built-in tool was given an unusable configuration.
    #[error("invalid configuration for tool {name}: {message}")]
    InvalidToolConfig {
        /// Tool name.
        name: String,
        /// What is wrong.
        message: String,
    },

    /// A tool ran and reported failure.
    #[error("tool {name} failed: {message}")]
    ToolFailed {
        /// Tool name.
        name: String,
        /// Failure description.
        message: String,
    },
}

impl EngineError {
    /// Check if this error can occur while provisioning a model.
    #[must_use]
    pub fn is_provisioning_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential(_)
                | Self::InvalidCredential(_)
                | Self::LocalUnavailable(_)
                | Self::ModelDownload(_)
                | Self::Network(_)
                | Self::Api { .. }
        )
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Stream(_) | Self::ModelDownload(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn network(err: &reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provisioning_failures() {
        assert!(EngineError::MissingCredential(ApiSpec::Claude).is_provisioning_failure());
        assert!(EngineError::LocalUnavailable("no server".into()).is_provisioning_failure());
        assert!(!EngineError::UnknownTool("x".into()).is_provisioning_failure());
    }

    #[test]
    fn retriable_api_statuses() {
        let rate_limited = EngineError::Api {
            status: 429,
            message: String::new(),
        };
        let bad_request = EngineError::Api {
            status: 400,
            message: String::new(),
        };
        assert!(rate_limited.is_retriable());
        assert!(!bad_request.is_retriable());
        assert!(!EngineError::InvalidCredential(ApiSpec::OpenAI).is_retriable());
    }
}
