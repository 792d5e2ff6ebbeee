//! Background agent worker for parley.
//!
//! The worker owns the language model and the session's tool set. The
//! controller talks to it only through JSON frames: [`WorkerCommand`]s in,
//! [`WorkerEvent`]s out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   commands (JSON)   ┌──────────────────────────┐
//! │  Controller (foreground) │ ──────────────────► │  AgentWorker (own thread │
//! │  WorkerSender /          │                     │  + tokio runtime)        │
//! │  WorkerReceiver          │ ◄────────────────── │  model, ToolSet, servers │
//! └──────────────────────────┘    events (JSON)    └────────────┬─────────────┘
//!                                                               │ spawned tasks
//!                                           provisioning, server connections, runs
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley_core::{Generation, LmConfig};
//! use parley_engine::{HttpModelBackend, HttpToolServerConnector, OllamaClient, ProviderEndpoints, DEFAULT_OLLAMA_HOST};
//! use parley_worker::{spawn_worker, WorkerCommand, WorkerDeps, WorkerEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let http = reqwest::Client::new();
//! let deps = WorkerDeps {
//!     backend: Arc::new(HttpModelBackend::new(
//!         http.clone(),
//!         OllamaClient::new(http.clone(), DEFAULT_OLLAMA_HOST),
//!         ProviderEndpoints::default(),
//!     )),
//!     connector: Arc::new(HttpToolServerConnector::new(http.clone())),
//!     http,
//! };
//!
//! let (tx, mut rx, _thread) = spawn_worker(deps)?;
//! assert_eq!(rx.recv().await, Some(WorkerEvent::WorkerReady));
//!
//! tx.send(&WorkerCommand::InitializeLocalAgent {
//!     generation: Generation::new(1),
//!     config: LmConfig::Local { model_name: "qwen3:4b".into() },
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! See the [`lifecycle`] module for the session state machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod channel;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod tools;
pub mod worker;

pub use channel::{decode_event, spawn_worker, spawn_worker_task, WorkerReceiver, WorkerSender, WorkerThread};
pub use error::{Result, WorkerError};
pub use protocol::{ErrorScope, WorkerCommand, WorkerEvent};
pub use tools::ToolSet;
pub use worker::{AgentWorker, WorkerDeps};
