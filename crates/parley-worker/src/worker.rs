//! The agent worker: owns the model and the tool set, executes commands in
//! arrival order and reports everything as events.
//!
//! Provisioning, server connections and runs are spawned tasks that report
//! back through an internal channel, so the command loop never blocks on
//! inference. Results of superseded work are dropped by generation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use parley_core::{Generation, LmConfig, Message, MessageDeltaOutput, RunConfig, SessionState, ToolKey};
use parley_engine::{
    create_builtin_tool, CacheProgress, EngineError, ExternalTool, LanguageModel, ModelBackend,
    ProgressSink, ToolServer, ToolServerConnector,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, WorkerError};
use crate::lifecycle;
use crate::protocol::{ErrorScope, WorkerCommand, WorkerEvent};
use crate::tools::ToolSet;

/// Results reported by the worker's own tasks.
enum Internal {
    Progress {
        generation: Generation,
        progress: CacheProgress,
    },
    Provisioned {
        generation: Generation,
        result: std::result::Result<Arc<dyn LanguageModel>, EngineError>,
    },
    ServerConnected {
        url: String,
        result: std::result::Result<Arc<dyn ToolServer>, EngineError>,
    },
    RunOutput {
        generation: Generation,
        output: MessageDeltaOutput,
    },
    RunFailed {
        generation: Generation,
        error: EngineError,
    },
    RunDone {
        generation: Generation,
    },
}

/// Capabilities the worker is built from.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Provisions models.
    pub backend: Arc<dyn ModelBackend>,
    /// Connects external tool servers.
    pub connector: Arc<dyn ToolServerConnector>,
    /// HTTP client for built-in tools.
    pub http: reqwest::Client,
}

/// The background agent session.
pub struct AgentWorker {
    deps: WorkerDeps,
    events: mpsc::UnboundedSender<String>,
    internal: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,

    state: SessionState,
    generation: Generation,
    model: Option<Arc<dyn LanguageModel>>,
    tools: ToolSet,
    servers: HashMap<String, Arc<dyn ToolServer>>,
    connecting: HashSet<String>,

    provisioning: Option<JoinHandle<()>>,
    run: Option<JoinHandle<()>>,
}

impl AgentWorker {
    /// Create a worker that writes serialized events to `events`.
    #[must_use]
    pub fn new(deps: WorkerDeps, events: mpsc::UnboundedSender<String>) -> Self {
        let (internal, internal_rx) = mpsc::unbounded_channel();
        Self {
            deps,
            events,
            internal,
            internal_rx: Some(internal_rx),
            state: SessionState::Uninitialized,
            generation: Generation::ZERO,
            model: None,
            tools: ToolSet::new(),
            servers: HashMap::new(),
            connecting: HashSet::new(),
            provisioning: None,
            run: None,
        }
    }

    /// Announce readiness, then process command frames until `commands`
    /// closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<String>) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };

        self.emit(WorkerEvent::WorkerReady);
        tracing::debug!("Agent worker started");

        loop {
            tokio::select! {
                frame = commands.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => break,
                },
                Some(message) = internal_rx.recv() => self.handle_internal(message),
            }
        }

        self.abort_tasks();
        tracing::debug!("Agent worker stopped");
    }

    fn emit(&self, event: WorkerEvent) {
        match serde_json::to_string(&event) {
            Ok(frame) => {
                if self.events.send(frame).is_err() {
                    tracing::debug!("Event receiver dropped");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode event"),
        }
    }

    fn emit_error(&self, generation: Option<Generation>, scope: ErrorScope, error: &dyn std::fmt::Display) {
        tracing::warn!(?scope, error = %error, "Worker error");
        self.emit(WorkerEvent::error(generation, scope, error.to_string()));
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.provisioning.take() {
            task.abort();
        }
        if let Some(task) = self.run.take() {
            task.abort();
        }
    }

    fn transition(&mut self, to: SessionState) -> Result<()> {
        self.state = lifecycle::validate_transition(self.state, to)?;
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_frame(&mut self, frame: &str) {
        let command: WorkerCommand = match serde_json::from_str(frame) {
            Ok(command) => command,
            Err(e) => {
                self.emit_error(None, ErrorScope::Transport, &WorkerError::Json(e));
                return;
            }
        };
        tracing::debug!(command = command.name(), "Handling command");
        self.handle_command(command);
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::InitializeLocalAgent { generation, config } => {
                if config.is_local() {
                    self.provision(generation, config, None);
                } else {
                    self.reject_config(generation, "initialize-local-agent needs a local model");
                }
            }
            WorkerCommand::InitializeApiAgent {
                generation,
                config,
                api_key,
            } => {
                if config.is_local() {
                    self.reject_config(generation, "initialize-api-agent needs an API model");
                } else {
                    self.provision(generation, config, Some(api_key));
                }
            }
            WorkerCommand::AddExternalServer { url } => self.connect_server(url),
            WorkerCommand::RemoveExternalServer { url } => self.remove_server(&url),
            WorkerCommand::RunAgent {
                generation,
                messages,
                agent_run_config,
            } => {
                if let Err(e) = self.start_run(generation, messages, agent_run_config) {
                    self.emit_error(Some(generation), ErrorScope::RunRejected, &e);
                }
            }
            tool_command => {
                if let Err(e) = self.handle_tool_command(tool_command) {
                    self.emit_error(None, ErrorScope::Tool, &e);
                }
            }
        }
    }

    fn reject_config(&self, generation: Generation, message: &str) {
        self.emit_error(
            Some(generation),
            ErrorScope::Command,
            &WorkerError::InvalidCommand(message.to_string()),
        );
    }

    fn provision(&mut self, generation: Generation, config: LmConfig, api_key: Option<String>) {
        if let Err(e) = self.transition(SessionState::Provisioning) {
            self.emit_error(Some(generation), ErrorScope::Command, &e);
            return;
        }

        // Supersede whatever the previous generation was doing.
        self.abort_tasks();
        self.model = None;
        self.tools.clear();
        self.generation = generation;

        tracing::info!(%generation, model = config.model_name(), "Provisioning model");

        let backend = Arc::clone(&self.deps.backend);
        let internal = self.internal.clone();
        self.provisioning = Some(tokio::spawn(async move {
            let (sink, mut progress_rx) = ProgressSink::channel();
            let forward = {
                let internal = internal.clone();
                tokio::spawn(async move {
                    while let Some(progress) = progress_rx.recv().await {
                        let _ = internal.send(Internal::Progress { generation, progress });
                    }
                })
            };

            let result = backend.provision(&config, api_key.as_deref(), sink).await;
            let _ = forward.await;
            let _ = internal.send(Internal::Provisioned { generation, result });
        }));
    }

    fn connect_server(&mut self, url: String) {
        if let Some(server) = self.servers.get(&url) {
            self.emit(WorkerEvent::ExternalServerRegistered {
                url,
                tools: server.tools().to_vec(),
            });
            return;
        }
        if !self.connecting.insert(url.clone()) {
            return;
        }

        tracing::info!(url = %url, "Connecting external server");
        let connector = Arc::clone(&self.deps.connector);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = internal.send(Internal::ServerConnected { url, result });
        });
    }

    fn remove_server(&mut self, url: &str) {
        let was_connecting = self.connecting.remove(url);
        let was_registered = self.servers.remove(url).is_some();
        let removed_tools = self.tools.remove_server(url);
        tracing::info!(
            url,
            was_connecting,
            was_registered,
            removed_tools,
            "Removed external server"
        );
    }

    fn handle_tool_command(&mut self, command: WorkerCommand) -> Result<()> {
        if !lifecycle::accepts_tool_changes(self.state) {
            return Err(WorkerError::NotReady(self.state));
        }

        match command {
            WorkerCommand::ClearTools => self.tools.clear(),
            WorkerCommand::AddBuiltinTool { name, config } => {
                let tool = create_builtin_tool(&self.deps.http, &name, &config)?;
                self.tools.insert(ToolKey::Builtin(name), tool)?;
            }
            WorkerCommand::AddExternalTool { url, name } => {
                let server = self
                    .servers
                    .get(&url)
                    .ok_or_else(|| WorkerError::UnknownServer(url.clone()))?;
                let tool = ExternalTool::from_server(server, &name)
                    .ok_or_else(|| WorkerError::UnknownTool(format!("{name} on {url}")))?;
                self.tools.insert(ToolKey::External { url, name }, Arc::new(tool))?;
            }
            WorkerCommand::RemoveTool { name, url } => {
                let key = ToolKey::new(name, url);
                if !self.tools.remove(&key) {
                    return Err(WorkerError::UnknownTool(key.to_string()));
                }
            }
            other => {
                return Err(WorkerError::InvalidCommand(format!(
                    "{} is not a tool command",
                    other.name()
                )))
            }
        }

        tracing::debug!(tools = ?self.tools.names(), "Tool set updated");
        Ok(())
    }

    fn start_run(&mut self, generation: Generation, messages: Vec<Message>, config: RunConfig) -> Result<()> {
        if !lifecycle::can_run(self.state) || generation != self.generation {
            return Err(WorkerError::NotReady(self.state));
        }
        if self.run.is_some() {
            return Err(WorkerError::RunActive);
        }
        if messages.is_empty() {
            return Err(WorkerError::EmptyHistory);
        }
        let model = self
            .model
            .clone()
            .ok_or(WorkerError::NotReady(self.state))?;

        tracing::info!(
            %generation,
            messages = messages.len(),
            tools = ?self.tools.names(),
            "Starting run"
        );

        let mut stream = model.run(messages, self.tools.tools(), config);
        let internal = self.internal.clone();
        self.run = Some(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(output) => {
                        let _ = internal.send(Internal::RunOutput { generation, output });
                    }
                    Err(error) => {
                        let _ = internal.send(Internal::RunFailed { generation, error });
                        break;
                    }
                }
            }
            let _ = internal.send(Internal::RunDone { generation });
        }));
        Ok(())
    }

    // =========================================================================
    // Task results
    // =========================================================================

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Progress { generation, progress } => {
                if generation == self.generation {
                    self.emit(WorkerEvent::ModelInitProgress { generation, progress });
                }
            }
            Internal::Provisioned { generation, result } => {
                if generation != self.generation || self.state != SessionState::Provisioning {
                    tracing::debug!(%generation, "Dropping stale provisioning result");
                    return;
                }
                self.provisioning = None;
                self.finish_provisioning(generation, result);
            }
            Internal::ServerConnected { url, result } => {
                if !self.connecting.remove(&url) {
                    tracing::debug!(url = %url, "Dropping connection to removed server");
                    return;
                }
                match result {
                    Ok(server) => {
                        let tools = server.tools().to_vec();
                        self.servers.insert(url.clone(), server);
                        self.emit(WorkerEvent::ExternalServerRegistered { url, tools });
                    }
                    Err(e) => {
                        self.emit_error(None, ErrorScope::ExternalServer { url }, &e);
                    }
                }
            }
            Internal::RunOutput { generation, output } => {
                if generation == self.generation && self.run.is_some() {
                    self.emit(WorkerEvent::AgentStreamDelta { generation, output });
                }
            }
            Internal::RunFailed { generation, error } => {
                if generation == self.generation && self.run.is_some() {
                    self.emit_error(Some(generation), ErrorScope::Run, &error);
                }
            }
            Internal::RunDone { generation } => {
                if generation == self.generation && self.run.take().is_some() {
                    tracing::info!(%generation, "Run finished");
                    self.emit(WorkerEvent::AgentStreamFinished { generation });
                }
            }
        }
    }

    fn finish_provisioning(
        &mut self,
        generation: Generation,
        result: std::result::Result<Arc<dyn LanguageModel>, EngineError>,
    ) {
        match result {
            Ok(model) => {
                if let Err(e) = self.transition(SessionState::Ready) {
                    self.emit_error(Some(generation), ErrorScope::Provisioning, &e);
                    return;
                }
                tracing::info!(%generation, model = model.model_name(), "Agent ready");
                self.model = Some(model);
                self.emit(WorkerEvent::AgentReady { generation });
            }
            Err(e) => {
                if let Err(transition) = self.transition(SessionState::Error) {
                    tracing::error!(error = %transition, "Unexpected session state");
                }
                self.emit_error(Some(generation), ErrorScope::Provisioning, &e);
            }
        }
    }
}
