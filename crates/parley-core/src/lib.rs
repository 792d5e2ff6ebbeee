//! Core types for parley.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Messages**: [`Message`], [`Part`] and their streaming counterparts
//!   [`MessageDelta`] / [`MessageDeltaOutput`]
//! - **Accumulation**: [`accumulate`] and [`finalize`], which fold a delta
//!   stream into a finished message
//! - **Configuration**: model binding ([`LmConfig`]), credentials and run
//!   options
//! - **Identifiers**: [`ThreadId`] and provisioning [`Generation`]s
//!
//! # Example
//!
//! ```
//! use parley_core::{accumulate, finalize, FinishReason, MessageDelta, MessageDeltaOutput, Role};
//!
//! let stream = vec![
//!     MessageDeltaOutput::partial(MessageDelta::text(Role::Assistant, "H")),
//!     MessageDeltaOutput::finished(MessageDelta::text(Role::Assistant, "i there"), FinishReason::Stop),
//! ];
//!
//! let mut state = None;
//! for output in stream {
//!     state = Some(accumulate(state, output.delta).unwrap());
//! }
//! let message = finalize(&state.unwrap()).unwrap();
//! assert_eq!(message.text(), "Hi there");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod accumulate;
pub mod config;
pub mod delta;
pub mod error;
pub mod ids;
pub mod message;
pub mod session;
pub mod tool;

pub use accumulate::{accumulate, finalize, AccumulatedState};
pub use config::{ApiKeys, ApiSpec, InferenceConfig, LmConfig, RunConfig, ThinkEffort};
pub use delta::{FinishReason, MessageDelta, MessageDeltaOutput, PartDelta};
pub use error::{CoreError, ProtocolError, Result};
pub use ids::{Generation, IdError, ThreadId};
pub use message::{Message, Part, Role};
pub use session::SessionState;
pub use tool::{ToolDesc, ToolKey};
