//! Agent session state machine.
//!
//! # State Machine
//!
//! ```text
//!     ┌───────────────┐
//!     │ Uninitialized │
//!     └───────┬───────┘
//!             │ (initialize)
//!             ▼
//!     ┌───────────────┐ (initialize: new generation supersedes)
//!     │ Provisioning  │◄──────────────┐
//!     └───┬───────┬───┘               │
//!         │       │ (load/bind fails) │
//!  (bound)│       ▼                   │
//!         │   ┌───────┐               │
//!         │   │ Error │───────────────┤ (reconfigured)
//!         ▼   └───────┘               │
//!     ┌───────────────┐               │
//!     │     Ready     │───────────────┘ (reconfigured)
//!     └───────────────┘
//! ```

use parley_core::SessionState;

use crate::error::{Result, WorkerError};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `WorkerError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<SessionState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(WorkerError::InvalidTransition { from, to })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Error, Provisioning, Ready, Uninitialized};

    matches!(
        (from, to),
        // Any (re)configuration starts provisioning, superseding in-flight work
        (Uninitialized | Provisioning | Ready | Error, Provisioning)
            | (Provisioning, Ready | Error)
    )
}

/// Returns true if runs are accepted in this state.
#[must_use]
pub const fn can_run(state: SessionState) -> bool {
    matches!(state, SessionState::Ready)
}

/// Returns true if tool registrations may change in this state.
#[must_use]
pub const fn accepts_tool_changes(state: SessionState) -> bool {
    matches!(state, SessionState::Ready)
}
