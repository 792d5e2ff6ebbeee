//! Model and tool capabilities for parley.
//!
//! This crate hides every inference and tool concern behind a few traits so
//! the agent worker can be driven by real providers or by scripted doubles.
//!
//! # Architecture
//!
//! - [`ModelBackend`] turns an [`LmConfig`](parley_core::LmConfig) into a
//!   [`LanguageModel`], downloading local weights with progress or verifying
//!   an API credential
//! - [`LanguageModel::run`] streams [`MessageDeltaOutput`](parley_core::MessageDeltaOutput)s,
//!   invoking [`Tool`]s between model turns
//! - [`ToolServerConnector`] registers external tool servers (MCP over HTTP)
//! - [`create_builtin_tool`] builds the built-in web tools
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use parley_core::{ApiSpec, LmConfig, Message, RunConfig};
//! use parley_engine::{
//!     HttpModelBackend, ModelBackend, OllamaClient, ProgressSink, ProviderEndpoints,
//!     DEFAULT_OLLAMA_HOST,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest::Client::new();
//! let backend = HttpModelBackend::new(
//!     client.clone(),
//!     OllamaClient::new(client, DEFAULT_OLLAMA_HOST),
//!     ProviderEndpoints::default(),
//! );
//!
//! let config = LmConfig::Api { spec: ApiSpec::OpenAI, model_name: "gpt-5.2".into() };
//! let model = backend.provision(&config, Some("sk-..."), ProgressSink::noop()).await?;
//!
//! let mut stream = model.run(vec![Message::user("Hello")], Vec::new(), RunConfig::default());
//! while let Some(output) = stream.next().await {
//!     print!("{}", output?.delta.contents.len());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod builtin;
pub mod chat;
pub mod error;
pub mod http;
pub mod mcp;
pub mod ollama;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use backend::{
    DeltaStream, ExternalTool, LanguageModel, ModelBackend, ProgressSink, Tool, ToolServer,
    ToolServerConnector,
};
pub use builtin::{create_builtin_tool, find_builtin, BuiltinToolInfo, BUILTIN_TOOLS};
pub use chat::ChatCompletionsModel;
pub use error::{EngineError, Result};
pub use http::HttpModelBackend;
pub use mcp::{HttpToolServerConnector, McpServer};
pub use ollama::{OllamaClient, DEFAULT_OLLAMA_HOST};
pub use types::{find_model, CacheProgress, ModelInfo, ModelSource, ProviderEndpoints, API_MODELS, LOCAL_MODELS};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{RecordedRun, ScriptStep, ScriptedBackend, StaticConnector};
