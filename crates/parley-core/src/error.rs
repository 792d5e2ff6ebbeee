//! Common error types for parley.

use thiserror::Error;

use crate::message::Role;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors shared across crates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A delta stream violated the message protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),
}

/// A delta conflicts with the message being accumulated.
///
/// Indicates a bug in the producer of the stream. The in-progress message is
/// discarded; persisted state is never affected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A delta carried a role different from the one already fixed.
    #[error("role mismatch: message is {expected}, delta says {got}")]
    RoleMismatch {
        /// The role fixed by an earlier delta.
        expected: Role,
        /// The role carried by the offending delta.
        got: Role,
    },

    /// A delta carried a tool-call id different from the one already fixed.
    #[error("id mismatch: message is {expected}, delta says {got}")]
    IdMismatch {
        /// The id fixed by an earlier delta.
        expected: String,
        /// The id carried by the offending delta.
        got: String,
    },

    /// A part appeared in a field that cannot hold its kind.
    #[error("unexpected {kind} part in {field}")]
    UnexpectedPart {
        /// The message field.
        field: &'static str,
        /// The part kind.
        kind: &'static str,
    },

    /// The stream finished without any delta carrying a role.
    #[error("message finished without a role")]
    MissingRole,
}
