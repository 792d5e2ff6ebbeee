//! Scripted backends and tool servers for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{
    FinishReason, LmConfig, Message, MessageDelta, MessageDeltaOutput, Part, PartDelta, Role,
    RunConfig, ToolDesc,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::backend::{
    DeltaStream, LanguageModel, ModelBackend, ProgressSink, Tool, ToolServer, ToolServerConnector,
};
use crate::error::{EngineError, Result};

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a delta.
    Emit(MessageDeltaOutput),
    /// End the run with a stream error.
    Fail(String),
    /// Pause until the notify fires.
    WaitFor(Arc<Notify>),
}

impl ScriptStep {
    /// A non-terminal assistant text fragment.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Emit(MessageDeltaOutput::partial(MessageDelta::text(
            Role::Assistant,
            text,
        )))
    }

    /// A terminal assistant text fragment.
    #[must_use]
    pub fn finish(text: &str) -> Self {
        Self::Emit(MessageDeltaOutput::finished(
            MessageDelta::text(Role::Assistant, text),
            FinishReason::Stop,
        ))
    }

    /// A complete assistant message requesting one tool call.
    #[must_use]
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self::Emit(MessageDeltaOutput::finished(
            MessageDelta {
                role: Some(Role::Assistant),
                tool_calls: vec![PartDelta::Function {
                    id: Some(id.to_string()),
                    name: Some(name.to_string()),
                    arguments: arguments.to_string(),
                }],
                ..MessageDelta::default()
            },
            FinishReason::ToolCall,
        ))
    }

    /// A complete tool result message.
    #[must_use]
    pub fn tool_result(id: &str, text: &str) -> Self {
        let message = Message::tool_result(Some(id.to_string()), vec![Part::text(text)]);
        Self::Emit(MessageDeltaOutput::finished(
            MessageDelta::from(message),
            FinishReason::Stop,
        ))
    }
}

/// What a scripted model was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    /// Messages passed to the run.
    pub messages: Vec<Message>,
    /// Names of the tools available to the run.
    pub tools: Vec<String>,
    /// Run options.
    pub config: RunConfig,
}

#[derive(Default)]
struct BackendState {
    progress: Vec<(u64, u64)>,
    failure: Option<String>,
    gates: VecDeque<Arc<Notify>>,
    scripts: VecDeque<Vec<ScriptStep>>,
    provisions: Vec<(LmConfig, Option<String>)>,
    runs: Vec<RecordedRun>,
}

/// A model backend whose models replay queued scripts.
///
/// Runs without a queued script answer `"ok"`.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl ScriptedBackend {
    /// Create a backend that provisions instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these `(current, total)` pairs during every provisioning.
    #[must_use]
    pub fn with_progress(self, progress: Vec<(u64, u64)>) -> Self {
        self.state.lock().progress = progress;
        self
    }

    /// Fail every provisioning with `message`.
    #[must_use]
    pub fn failing(self, message: &str) -> Self {
        self.state.lock().failure = Some(message.to_string());
        self
    }

    /// Hold the next provisioning until `gate` fires.
    pub fn gate_next(&self, gate: Arc<Notify>) {
        self.state.lock().gates.push_back(gate);
    }

    /// Stop failing provisioning.
    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    /// Queue the script for the next run.
    pub fn push_run(&self, steps: Vec<ScriptStep>) {
        self.state.lock().scripts.push_back(steps);
    }

    /// Model configs provisioned so far, with the credential used.
    #[must_use]
    pub fn provisions(&self) -> Vec<(LmConfig, Option<String>)> {
        self.state.lock().provisions.clone()
    }

    /// Runs started so far.
    #[must_use]
    pub fn runs(&self) -> Vec<RecordedRun> {
        self.state.lock().runs.clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn provision(
        &self,
        config: &LmConfig,
        api_key: Option<&str>,
        progress: ProgressSink,
    ) -> Result<Arc<dyn LanguageModel>> {
        let (steps, gate) = {
            let mut state = self.state.lock();
            state
                .provisions
                .push((config.clone(), api_key.map(str::to_string)));
            (state.progress.clone(), state.gates.pop_front())
        };

        for (current, total) in steps {
            progress.report(current, total);
        }
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(message) = self.state.lock().failure.clone() {
            return Err(EngineError::LocalUnavailable(message));
        }
        Ok(Arc::new(ScriptedModel {
            name: config.model_name().to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// A model provisioned by [`ScriptedBackend`].
pub struct ScriptedModel {
    name: String,
    state: Arc<Mutex<BackendState>>,
}

impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn run(&self, messages: Vec<Message>, tools: Vec<Arc<dyn Tool>>, config: RunConfig) -> DeltaStream {
        let steps = {
            let mut state = self.state.lock();
            state.runs.push(RecordedRun {
                messages,
                tools: tools.iter().map(|t| t.desc().name.clone()).collect(),
                config,
            });
            state
                .scripts
                .pop_front()
                .unwrap_or_else(|| vec![ScriptStep::finish("ok")])
        };

        let (tx, stream) = DeltaStream::channel();
        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Emit(output) => {
                        if tx.send(Ok(output)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Fail(message) => {
                        let _ = tx.send(Err(EngineError::Stream(message))).await;
                        return;
                    }
                    ScriptStep::WaitFor(notify) => notify.notified().await,
                }
            }
        });
        stream
    }
}

/// A connector serving fixed tool lists.
#[derive(Clone, Default)]
pub struct StaticConnector {
    servers: Arc<Mutex<HashMap<String, Vec<ToolDesc>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    gates: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl StaticConnector {
    /// Create a connector with no servers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve tools named `tools` at `url`.
    #[must_use]
    pub fn with_server(self, url: &str, tools: &[&str]) -> Self {
        let descs = tools
            .iter()
            .map(|name| ToolDesc::new(*name, format!("{name} tool"), json!({ "type": "object" })))
            .collect();
        self.servers.lock().insert(url.to_string(), descs);
        self
    }

    /// Refuse connections to `url`.
    #[must_use]
    pub fn with_failing(self, url: &str) -> Self {
        self.failing.lock().insert(url.to_string());
        self
    }

    /// Hold connections to `url` until `gate` fires.
    #[must_use]
    pub fn gated(self, url: &str, gate: Arc<Notify>) -> Self {
        self.gates.lock().insert(url.to_string(), gate);
        self
    }
}

#[async_trait]
impl ToolServerConnector for StaticConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ToolServer>> {
        let gate = self.gates.lock().get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.lock().contains(url) {
            return Err(EngineError::ToolServer {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let tools = self
            .servers
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::ToolServer {
                url: url.to_string(),
                message: "no such server".to_string(),
            })?;
        Ok(Arc::new(StaticToolServer {
            url: url.to_string(),
            tools,
        }))
    }
}

/// A tool server whose tools echo their arguments.
pub struct StaticToolServer {
    url: String,
    tools: Vec<ToolDesc>,
}

#[async_trait]
impl ToolServer for StaticToolServer {
    fn url(&self) -> &str {
        &self.url
    }

    fn tools(&self) -> &[ToolDesc] {
        &self.tools
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if !self.tools.iter().any(|t| t.name == name) {
            return Err(EngineError::UnknownTool(name.to_string()));
        }
        Ok(json!({ "tool": name, "arguments": arguments }))
    }
}
