//! Foreground chat runtime for parley.
//!
//! This crate ties the thread store to the agent worker:
//!
//! - [`AgentController`] mirrors the worker's session, owns the persisted
//!   agent settings and replays tool selections after every provisioning
//! - [`ChatRuntime`] turns user input into runs, folds the delta stream into
//!   an ongoing message and stores each finished message in the thread the
//!   run started in
//!
//! # Architecture
//!
//! ```text
//! AppendMessage ──► ChatRuntime ──► Store (append / truncate)
//!                       │
//!                       ├──► AgentController ──► WorkerSender ──► worker
//!                       │
//!                       ◄── next_event() ◄── WorkerReceiver ◄── worker
//!                       │
//!                       └──► broadcast::Sender<RuntimeEvent> ──► observers
//! ```
//!
//! # Example
//!
//! ```no_run
//! use parley_runtime::{AppendMessage, ChatRuntime, RuntimeConfig, RuntimeEvent};
//!
//! # async fn example() -> parley_runtime::Result<()> {
//! let (mut runtime, _worker) = ChatRuntime::launch(RuntimeConfig::default()).await?;
//! runtime.configure(|agent| agent.select_model_by_name("gpt-5.2"))?;
//!
//! while let Some(event) = runtime.next_event().await {
//!     if let RuntimeEvent::AgentReady { .. } = event {
//!         runtime.on_new(AppendMessage::text("Hello"))?;
//!     }
//!     if let RuntimeEvent::RunFinished { .. } = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod events;
pub mod runtime;

pub use config::RuntimeConfig;
pub use controller::{AgentController, AgentEvent, ServerStatus};
pub use convert::{AppendMessage, Attachment, AttachmentKind, TurnContent};
pub use error::{Result, RunPreconditionError, RuntimeError};
pub use events::RuntimeEvent;
pub use runtime::ChatRuntime;
