//! Capability traits: model backends, language models and tools.
//!
//! The worker only ever talks to these traits. [`HttpModelBackend`] and
//! [`HttpToolServerConnector`] are the production implementations; the
//! `test-utils` feature provides scripted ones.
//!
//! [`HttpModelBackend`]: crate::http::HttpModelBackend
//! [`HttpToolServerConnector`]: crate::mcp::HttpToolServerConnector

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parley_core::{LmConfig, Message, MessageDeltaOutput, RunConfig, ToolDesc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::CacheProgress;

/// Buffer size of a run's delta channel.
pub const DELTA_BUFFER: usize = 256;

/// The output of one run: deltas for every message the run produces, each
/// message ending with a `finish_reason`.
///
/// Dropping the stream cancels the run at its next send.
pub struct DeltaStream {
    rx: mpsc::Receiver<Result<MessageDeltaOutput>>,
}

impl DeltaStream {
    /// Create a stream and the sender that feeds it.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<Result<MessageDeltaOutput>>, Self) {
        let (tx, rx) = mpsc::channel(DELTA_BUFFER);
        (tx, Self { rx })
    }
}

impl Stream for DeltaStream {
    type Item = Result<MessageDeltaOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Receives download progress during provisioning.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<CacheProgress>>,
}

impl ProgressSink {
    /// Create a sink and the receiver of its reports.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CacheProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards reports.
    #[must_use]
    pub const fn noop() -> Self {
        Self { tx: None }
    }

    /// Report `current` of `total` bytes.
    pub fn report(&self, current: u64, total: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(CacheProgress { current, total });
        }
    }
}

/// Turns a model selection into a usable [`LanguageModel`].
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Download, load or bind the model described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be made available; see
    /// [`EngineError::is_provisioning_failure`](crate::EngineError::is_provisioning_failure).
    async fn provision(
        &self,
        config: &LmConfig,
        api_key: Option<&str>,
        progress: ProgressSink,
    ) -> Result<Arc<dyn LanguageModel>>;
}

/// A provisioned model.
pub trait LanguageModel: Send + Sync {
    /// Model name.
    fn model_name(&self) -> &str;

    /// Start a run over `messages` with `tools` available.
    ///
    /// Must be called from within a tokio runtime.
    fn run(&self, messages: Vec<Message>, tools: Vec<Arc<dyn Tool>>, config: RunConfig)
        -> DeltaStream;
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Descriptor presented to the model.
    fn desc(&self) -> &ToolDesc;

    /// Invoke the tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments are invalid or the call fails.
    async fn call(&self, arguments: Value) -> Result<Value>;
}

/// A connected external tool server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Server URL.
    fn url(&self) -> &str;

    /// Tools discovered during registration.
    fn tools(&self) -> &[ToolDesc];

    /// Invoke a tool by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects or fails the call.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// Registers external tool servers.
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    /// Connect to the server at `url` and discover its tools.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ToolServer` if the handshake or discovery fails.
    async fn connect(&self, url: &str) -> Result<Arc<dyn ToolServer>>;
}

/// A tool exposed by an external tool server.
pub struct ExternalTool {
    server: Arc<dyn ToolServer>,
    desc: ToolDesc,
}

impl ExternalTool {
    /// Bind the tool `name` of `server`, if the server exposes it.
    #[must_use]
    pub fn from_server(server: &Arc<dyn ToolServer>, name: &str) -> Option<Self> {
        let desc = server.tools().iter().find(|t| t.name == name)?.clone();
        Some(Self {
            server: Arc::clone(server),
            desc,
        })
    }
}

#[async_trait]
impl Tool for ExternalTool {
    fn desc(&self) -> &ToolDesc {
        &self.desc
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        self.server.call_tool(&self.desc.name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::{FinishReason, MessageDelta, Role};

    #[tokio::test]
    async fn delta_stream_yields_in_send_order() {
        let (tx, mut stream) = DeltaStream::channel();
        tokio::spawn(async move {
            for text in ["a", "b"] {
                let delta = MessageDelta::text(Role::Assistant, text);
                tx.send(Ok(MessageDeltaOutput::partial(delta))).await.unwrap();
            }
            let done = MessageDeltaOutput::finished(MessageDelta::default(), FinishReason::Stop);
            tx.send(Ok(done)).await.unwrap();
        });

        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[2].is_terminal());
        assert_eq!(seen[0].delta.contents[0], parley_core::PartDelta::text("a"));
    }

    #[tokio::test]
    async fn progress_sink_reports() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.report(10, 100);
        ProgressSink::noop().report(1, 1);
        assert_eq!(rx.recv().await, Some(CacheProgress { current: 10, total: 100 }));
    }
}
