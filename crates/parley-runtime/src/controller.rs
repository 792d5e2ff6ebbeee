//! The foreground proxy of the agent session.
//!
//! The controller owns the persisted agent settings, mirrors the worker's
//! session state and translates selections into worker commands. Every
//! provisioning request gets the next [`Generation`]; events tagged with any
//! other generation are dropped.
//!
//! Tool selections are intents: they are persisted immediately and replayed
//! in a fixed order each time the current generation becomes ready.

use std::collections::HashMap;
use std::sync::Arc;

use parley_core::{
    ApiKeys, ApiSpec, Generation, LmConfig, Message, MessageDeltaOutput, RunConfig, SessionState,
    ThinkEffort, ToolDesc,
};
use parley_engine::{find_builtin, find_model, CacheProgress, ModelSource, OllamaClient};
use parley_store::{settings::key, ExternalServerRecord, SettingsExt, Store};
use parley_worker::{lifecycle, ErrorScope, WorkerCommand, WorkerEvent, WorkerSender};

use crate::config::RuntimeConfig;
use crate::error::{Result, RunPreconditionError, RuntimeError};

/// Registration status of an external server in the current worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// `add-external-server` sent, no answer yet.
    Registering,
    /// Connected; its tools can be selected.
    Ready,
    /// The last registration attempt failed.
    Failed,
}

/// What a worker event changed, as seen by the controller.
#[derive(Debug)]
pub enum AgentEvent {
    /// Model download progress.
    Progress {
        /// Generation being provisioned.
        generation: Generation,
        /// Bytes fetched so far.
        progress: CacheProgress,
    },
    /// The session became ready and tool intents were applied.
    Ready {
        /// Generation that became ready.
        generation: Generation,
    },
    /// An external server connected.
    ServerRegistered {
        /// Server URL.
        url: String,
        /// Tools the server exposes.
        tools: Vec<ToolDesc>,
    },
    /// One delta of the active run.
    Delta(MessageDeltaOutput),
    /// The active run ended.
    RunFinished,
    /// Something failed.
    Failed(RuntimeError),
}

/// Foreground proxy of the agent session.
pub struct AgentController<S: Store + ?Sized> {
    store: Arc<S>,
    config: RuntimeConfig,
    ollama: OllamaClient,
    sender: WorkerSender,

    worker_ready: bool,
    local_supported: bool,
    state: SessionState,
    generation: Generation,
    progress: Option<CacheProgress>,
    running: bool,
    server_status: HashMap<String, ServerStatus>,
}

impl<S: Store + ?Sized> AgentController<S> {
    /// Create a controller sending commands through `sender`.
    #[must_use]
    pub fn new(store: Arc<S>, config: RuntimeConfig, http: &reqwest::Client, sender: WorkerSender) -> Self {
        let ollama = config.ollama(http);
        Self {
            store,
            config,
            ollama,
            sender,
            worker_ready: false,
            local_supported: false,
            state: SessionState::Uninitialized,
            generation: Generation::ZERO,
            progress: None,
            running: false,
            server_status: HashMap::new(),
        }
    }

    // =========================================================================
    // Session view
    // =========================================================================

    /// Mirrored session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the latest provisioning request.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns true if runs are accepted.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Returns true while a run is streaming.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Download progress of the model being provisioned.
    #[must_use]
    pub const fn progress(&self) -> Option<CacheProgress> {
        self.progress
    }

    /// Returns true if the local model server answered the last check.
    #[must_use]
    pub const fn local_supported(&self) -> bool {
        self.local_supported
    }

    /// Registration status of the server at `url`.
    #[must_use]
    pub fn server_status(&self, url: &str) -> Option<ServerStatus> {
        self.server_status.get(url).copied()
    }

    // =========================================================================
    // Persisted settings
    // =========================================================================

    /// The selected model.
    #[must_use]
    pub fn selected_model(&self) -> Option<LmConfig> {
        self.store.load(key::SELECTED_MODEL, None)
    }

    /// Stored API credentials.
    #[must_use]
    pub fn api_keys(&self) -> ApiKeys {
        self.store.load(key::API_KEYS, ApiKeys::default())
    }

    /// Local models whose weights are present.
    #[must_use]
    pub fn downloaded_models(&self) -> Vec<String> {
        self.store.load(key::DOWNLOADED_MODELS, Vec::new())
    }

    /// Selected built-in tool ids in selection order.
    #[must_use]
    pub fn builtin_tools(&self) -> Vec<String> {
        self.store.load(key::SELECTED_BUILTIN_TOOLS, Vec::new())
    }

    /// Registered external servers in registration order.
    #[must_use]
    pub fn servers(&self) -> Vec<ExternalServerRecord> {
        self.store.load(key::EXTERNAL_SERVERS, Vec::new())
    }

    /// The system prompt; empty when unset.
    #[must_use]
    pub fn system_prompt(&self) -> String {
        self.store.load(key::SYSTEM_PROMPT, String::new())
    }

    /// Options applied to every run.
    #[must_use]
    pub fn run_config(&self) -> RunConfig {
        self.store.load(key::AGENT_RUN_CONFIG, RunConfig::default())
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Check the local model server. Local models are only provisioned when
    /// it answers.
    pub async fn check_local(&mut self) -> bool {
        self.local_supported = match self.ollama.version().await {
            Ok(version) => {
                tracing::info!(host = %self.ollama.host(), %version, "Local model server available");
                true
            }
            Err(e) => {
                tracing::info!(host = %self.ollama.host(), error = %e, "Local model server unavailable");
                false
            }
        };
        self.local_supported
    }

    /// The worker announced itself: register persisted servers and provision
    /// the selected model if it is eligible.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker channel is closed.
    pub fn on_worker_ready(&mut self) -> Result<()> {
        self.worker_ready = true;
        for server in self.servers() {
            self.register_server(server.url)?;
        }
        self.provision()?;
        Ok(())
    }

    // =========================================================================
    // Model selection
    // =========================================================================

    /// Request provisioning of the selected model if it is eligible.
    ///
    /// Local models need the local model server; API models need a stored
    /// credential. Returns true if a request was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker channel is closed.
    pub fn provision(&mut self) -> Result<bool> {
        if !self.worker_ready {
            return Ok(false);
        }
        let Some(model) = self.selected_model() else {
            tracing::debug!("No model selected");
            return Ok(false);
        };

        let generation = self.generation.next();
        let command = match model {
            LmConfig::Local { .. } => {
                if !self.local_supported {
                    tracing::info!(model = model.model_name(), "Local model server unavailable, not provisioning");
                    return Ok(false);
                }
                WorkerCommand::InitializeLocalAgent {
                    generation,
                    config: model,
                }
            }
            LmConfig::Api { spec, .. } => {
                let Some(api_key) = self.api_keys().get(spec).map(str::to_string) else {
                    tracing::info!(%spec, "No credential stored, not provisioning");
                    return Ok(false);
                };
                WorkerCommand::InitializeApiAgent {
                    generation,
                    config: model,
                    api_key,
                }
            }
        };

        self.sender.send(&command)?;
        self.state = lifecycle::validate_transition(self.state, SessionState::Provisioning)?;
        self.generation = generation;
        self.progress = None;
        if self.running {
            tracing::debug!(%generation, "Active run superseded");
            self.running = false;
        }
        tracing::info!(%generation, "Provisioning requested");
        Ok(true)
    }

    /// Select a model and provision it. Local models must be downloaded
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::ModelNotDownloaded` for a local model that is
    /// not downloaded.
    pub fn select_model(&mut self, model: LmConfig) -> Result<bool> {
        if let LmConfig::Local { model_name } = &model {
            if !self.downloaded_models().contains(model_name) {
                return Err(RuntimeError::ModelNotDownloaded(model_name.clone()));
            }
        }
        self.store.save(key::SELECTED_MODEL, &Some(model))?;
        self.provision()
    }

    /// Select a catalog model by name.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownModel` for names outside the catalog.
    pub fn select_model_by_name(&mut self, name: &str) -> Result<bool> {
        let info = find_model(name).ok_or_else(|| RuntimeError::UnknownModel(name.to_string()))?;
        self.select_model(info.config())
    }

    /// Store or clear a credential. Reprovisions if the selected model uses
    /// this provider and a credential is now present.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be written.
    pub fn set_api_key(&mut self, spec: ApiSpec, api_key: Option<String>) -> Result<bool> {
        let mut keys = self.api_keys();
        keys.set(spec, api_key);
        self.store.save(key::API_KEYS, &keys)?;

        match self.selected_model() {
            Some(LmConfig::Api { spec: selected, .. }) if selected == spec && keys.get(spec).is_some() => {
                self.provision()
            }
            _ => Ok(false),
        }
    }

    /// Download a local model and select it. The weights are pulled while
    /// provisioning, with progress.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownModel` unless `name` is a local catalog
    /// model, or an engine error if the local model server is unavailable.
    pub fn download_model(&mut self, name: &str) -> Result<bool> {
        let info = find_model(name)
            .filter(|m| m.source == ModelSource::Local)
            .ok_or_else(|| RuntimeError::UnknownModel(name.to_string()))?;
        if !self.local_supported {
            return Err(parley_engine::EngineError::LocalUnavailable(self.ollama.host().to_string()).into());
        }
        self.store.save(key::SELECTED_MODEL, &Some(info.config()))?;
        self.provision()
    }

    /// Delete a local model's weights. Unselects it if selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the local model server refuses the deletion.
    pub async fn remove_model(&mut self, name: &str) -> Result<()> {
        self.ollama.delete(name).await?;

        let mut downloaded = self.downloaded_models();
        downloaded.retain(|m| m != name);
        self.store.save(key::DOWNLOADED_MODELS, &downloaded)?;

        if matches!(self.selected_model(), Some(LmConfig::Local { model_name }) if model_name == name) {
            self.store.save(key::SELECTED_MODEL, &None::<LmConfig>)?;
        }
        Ok(())
    }

    fn record_download(&self) {
        let Some(LmConfig::Local { model_name }) = self.selected_model() else {
            return;
        };
        let mut downloaded = self.downloaded_models();
        if downloaded.contains(&model_name) {
            return;
        }
        downloaded.push(model_name);
        if let Err(e) = self.store.save(key::DOWNLOADED_MODELS, &downloaded) {
            tracing::warn!(error = %e, "Failed to record downloaded model");
        }
    }

    // =========================================================================
    // Run options
    // =========================================================================

    /// Replace the system prompt. Empty disables it.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be written.
    pub fn set_system_prompt(&self, prompt: &str) -> Result<()> {
        self.store.save(key::SYSTEM_PROMPT, prompt)?;
        Ok(())
    }

    /// Replace the run options.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be written.
    pub fn set_run_config(&self, config: &RunConfig) -> Result<()> {
        self.store.save(key::AGENT_RUN_CONFIG, config)?;
        Ok(())
    }

    /// Turn model reasoning on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be written.
    pub fn set_reasoning(&self, enabled: bool) -> Result<()> {
        let mut config = self.run_config();
        config.set_think_effort(if enabled {
            ThinkEffort::Enable
        } else {
            ThinkEffort::Disable
        });
        self.set_run_config(&config)
    }

    // =========================================================================
    // Tools
    // =========================================================================

    /// Select or unselect a built-in tool.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownTool` for ids outside the catalog.
    pub fn set_builtin_tool(&mut self, id: &str, enabled: bool) -> Result<()> {
        find_builtin(id).ok_or_else(|| RuntimeError::UnknownTool(id.to_string()))?;

        let mut selected = self.builtin_tools();
        let present = selected.iter().any(|t| t == id);
        if present == enabled {
            return Ok(());
        }
        if enabled {
            selected.push(id.to_string());
        } else {
            selected.retain(|t| t != id);
        }
        self.store.save(key::SELECTED_BUILTIN_TOOLS, &selected)?;

        if self.is_ready() {
            let command = if enabled {
                WorkerCommand::AddBuiltinTool {
                    name: id.to_string(),
                    config: self.config.builtin_tool_config(id),
                }
            } else {
                WorkerCommand::RemoveTool {
                    name: id.to_string(),
                    url: None,
                }
            };
            self.sender.send(&command)?;
        }
        Ok(())
    }

    /// Register an external tool server.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be written.
    pub fn add_server(&mut self, url: &str) -> Result<()> {
        let mut servers = self.servers();
        if servers.iter().any(|s| s.url == url) {
            return Ok(());
        }
        servers.push(ExternalServerRecord::new(url));
        self.store.save(key::EXTERNAL_SERVERS, &servers)?;

        if self.worker_ready {
            self.register_server(url.to_string())?;
        }
        Ok(())
    }

    /// Unregister an external tool server with its tools and selections.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownServer` if no server has this URL.
    pub fn remove_server(&mut self, url: &str) -> Result<()> {
        let mut servers = self.servers();
        let before = servers.len();
        servers.retain(|s| s.url != url);
        if servers.len() == before {
            return Err(RuntimeError::UnknownServer(url.to_string()));
        }
        self.store.save(key::EXTERNAL_SERVERS, &servers)?;
        self.server_status.remove(url);

        if self.worker_ready {
            self.sender.send(&WorkerCommand::RemoveExternalServer {
                url: url.to_string(),
            })?;
        }
        tracing::info!(url, "External server removed");
        Ok(())
    }

    /// Select or unselect one tool of a registered server.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownServer` if no server has this URL, or
    /// `RuntimeError::UnknownTool` if the connected server does not offer
    /// `name`.
    pub fn set_server_tool(&mut self, url: &str, name: &str, enabled: bool) -> Result<()> {
        let mut servers = self.servers();
        let record = servers
            .iter_mut()
            .find(|s| s.url == url)
            .ok_or_else(|| RuntimeError::UnknownServer(url.to_string()))?;

        let connected = self.server_status(url) == Some(ServerStatus::Ready);
        if enabled && connected && !record.tools.iter().any(|t| t.name == name) {
            return Err(RuntimeError::UnknownTool(format!("{name} on {url}")));
        }
        if record.is_selected(name) == enabled {
            return Ok(());
        }
        if enabled {
            record.selected.push(name.to_string());
        } else {
            record.selected.retain(|s| s != name);
        }
        self.store.save(key::EXTERNAL_SERVERS, &servers)?;

        if self.is_ready() && connected {
            let command = if enabled {
                WorkerCommand::AddExternalTool {
                    url: url.to_string(),
                    name: name.to_string(),
                }
            } else {
                WorkerCommand::RemoveTool {
                    name: name.to_string(),
                    url: Some(url.to_string()),
                }
            };
            self.sender.send(&command)?;
        }
        Ok(())
    }

    fn register_server(&mut self, url: String) -> Result<()> {
        self.server_status.insert(url.clone(), ServerStatus::Registering);
        self.sender.send(&WorkerCommand::AddExternalServer { url })?;
        Ok(())
    }

    /// Replay every tool selection: clear, built-ins in selection order, then
    /// each connected server's selected tools sorted by name.
    fn apply_tool_intents(&self) -> Result<()> {
        self.sender.send(&WorkerCommand::ClearTools)?;
        for id in self.builtin_tools() {
            let config = self.config.builtin_tool_config(&id);
            self.sender.send(&WorkerCommand::AddBuiltinTool { name: id, config })?;
        }
        for server in self.servers() {
            if self.server_status(&server.url) == Some(ServerStatus::Ready) {
                self.apply_server_selection(&server)?;
            }
        }
        Ok(())
    }

    fn apply_server_selection(&self, server: &ExternalServerRecord) -> Result<()> {
        let mut names: Vec<&str> = server
            .selected
            .iter()
            .filter(|name| server.tools.iter().any(|t| &t.name == *name))
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        for name in names {
            self.sender.send(&WorkerCommand::AddExternalTool {
                url: server.url.clone(),
                name: name.to_string(),
            })?;
        }
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Check that a run could start now.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` unless the session is ready, or `RunActive` while
    /// a run is streaming.
    pub const fn check_can_run(&self) -> std::result::Result<(), RunPreconditionError> {
        if !self.state.is_ready() {
            return Err(RunPreconditionError::NotReady(self.state));
        }
        if self.running {
            return Err(RunPreconditionError::RunActive);
        }
        Ok(())
    }

    /// Start a run over `history`, prefixed with the system prompt if set.
    ///
    /// # Errors
    ///
    /// Returns a `RunPrecondition` error if the run cannot start, or an error
    /// if the worker channel is closed.
    pub fn run(&mut self, history: Vec<Message>) -> Result<Generation> {
        self.check_can_run()?;
        if history.is_empty() {
            return Err(RunPreconditionError::EmptyHistory.into());
        }

        let prompt = self.system_prompt();
        let messages = if prompt.is_empty() {
            history
        } else {
            std::iter::once(Message::system(prompt)).chain(history).collect()
        };

        self.sender.send(&WorkerCommand::RunAgent {
            generation: self.generation,
            messages,
            agent_run_config: self.run_config(),
        })?;
        self.running = true;
        Ok(self.generation)
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    /// Apply a worker event. Returns `None` for events that change nothing,
    /// including every event of a stale generation.
    pub fn handle_event(&mut self, event: WorkerEvent) -> Option<AgentEvent> {
        if let Some(generation) = event.generation() {
            if generation != self.generation {
                tracing::debug!(%generation, current = %self.generation, "Ignoring stale event");
                return None;
            }
        }

        match event {
            WorkerEvent::WorkerReady => {
                tracing::debug!("Ignoring repeated worker-ready");
                None
            }
            WorkerEvent::ModelInitProgress { generation, progress } => {
                if self.state != SessionState::Provisioning {
                    return None;
                }
                self.progress = Some(progress);
                Some(AgentEvent::Progress { generation, progress })
            }
            WorkerEvent::AgentReady { generation } => {
                if self.state != SessionState::Provisioning {
                    return None;
                }
                self.state = SessionState::Ready;
                self.progress = None;
                self.record_download();
                if let Err(e) = self.apply_tool_intents() {
                    tracing::warn!(error = %e, "Failed to apply tool selections");
                }
                tracing::info!(%generation, "Agent ready");
                Some(AgentEvent::Ready { generation })
            }
            WorkerEvent::ExternalServerRegistered { url, tools } => self.on_server_registered(url, tools),
            WorkerEvent::AgentStreamDelta { output, .. } => self.running.then_some(AgentEvent::Delta(output)),
            WorkerEvent::AgentStreamFinished { .. } => {
                if !self.running {
                    return None;
                }
                self.running = false;
                Some(AgentEvent::RunFinished)
            }
            WorkerEvent::Error { scope, message, .. } => Some(AgentEvent::Failed(self.on_error(scope, message))),
        }
    }

    fn on_server_registered(&mut self, url: String, tools: Vec<ToolDesc>) -> Option<AgentEvent> {
        let mut servers = self.servers();
        let Some(record) = servers.iter_mut().find(|s| s.url == url) else {
            tracing::debug!(url = %url, "Ignoring registration of unknown server");
            return None;
        };
        record.tools.clone_from(&tools);
        let record = record.clone();
        if let Err(e) = self.store.save(key::EXTERNAL_SERVERS, &servers) {
            tracing::warn!(url = %url, error = %e, "Failed to persist discovered tools");
        }
        self.server_status.insert(url.clone(), ServerStatus::Ready);

        if self.is_ready() {
            if let Err(e) = self.apply_server_selection(&record) {
                tracing::warn!(url = %url, error = %e, "Failed to apply tool selections");
            }
        }
        tracing::info!(url = %url, tools = tools.len(), "External server registered");
        Some(AgentEvent::ServerRegistered { url, tools })
    }

    fn on_error(&mut self, scope: ErrorScope, message: String) -> RuntimeError {
        tracing::warn!(?scope, %message, "Worker reported an error");
        match scope {
            ErrorScope::Provisioning => {
                if self.state == SessionState::Provisioning {
                    self.state = SessionState::Error;
                    self.progress = None;
                }
                RuntimeError::Provisioning(message)
            }
            ErrorScope::Run => RuntimeError::Run(message),
            ErrorScope::RunRejected => {
                self.running = false;
                RuntimeError::RunRejected(message)
            }
            ErrorScope::ExternalServer { url } => {
                if self.server_status.contains_key(&url) {
                    self.server_status.insert(url.clone(), ServerStatus::Failed);
                }
                RuntimeError::ExternalServer { url, message }
            }
            ErrorScope::Tool => RuntimeError::Tool(message),
            ErrorScope::Command => RuntimeError::Command(message),
            ErrorScope::Transport => RuntimeError::Transport(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{FinishReason, MessageDelta, Role};
    use parley_store::RocksStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        controller: AgentController<RocksStore>,
        commands: mpsc::UnboundedReceiver<String>,
        store: Arc<RocksStore>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(RocksStore::open(dir.path()).unwrap());
            let (tx, commands) = mpsc::unbounded_channel();
            let controller = AgentController::new(
                Arc::clone(&store),
                RuntimeConfig::default(),
                &reqwest::Client::new(),
                WorkerSender::new(tx),
            );
            Self {
                controller,
                commands,
                store,
                _dir: dir,
            }
        }

        fn sent(&mut self) -> Vec<WorkerCommand> {
            let mut sent = Vec::new();
            while let Ok(frame) = self.commands.try_recv() {
                sent.push(serde_json::from_str(&frame).unwrap());
            }
            sent
        }

        fn with_api_model(mut self) -> Self {
            self.controller
                .set_api_key(ApiSpec::OpenAI, Some("sk-test".into()))
                .unwrap();
            self.controller.select_model_by_name("gpt-5.2").unwrap();
            self
        }

        /// Worker up, provisioned and ready at generation 1.
        fn ready(mut self) -> Self {
            self.controller.on_worker_ready().unwrap();
            let event = self.controller.handle_event(WorkerEvent::AgentReady {
                generation: Generation::new(1),
            });
            assert!(matches!(event, Some(AgentEvent::Ready { .. })));
            self.sent();
            self
        }
    }

    fn gen(n: u64) -> Generation {
        Generation::new(n)
    }

    #[test]
    fn provisions_selected_api_model_on_worker_ready() {
        let mut h = Harness::new().with_api_model();
        assert!(h.sent().is_empty());

        h.controller.on_worker_ready().unwrap();
        assert_eq!(h.controller.state(), SessionState::Provisioning);
        assert_eq!(
            h.sent(),
            vec![WorkerCommand::InitializeApiAgent {
                generation: gen(1),
                config: LmConfig::Api {
                    spec: ApiSpec::OpenAI,
                    model_name: "gpt-5.2".into()
                },
                api_key: "sk-test".into(),
            }]
        );
    }

    #[test]
    fn missing_credential_or_local_server_skips_provisioning() {
        let mut h = Harness::new();
        h.controller.on_worker_ready().unwrap();
        assert!(!h.controller.select_model_by_name("claude-sonnet-4-5").unwrap());
        assert_eq!(h.controller.state(), SessionState::Uninitialized);

        assert!(h
            .controller
            .set_api_key(ApiSpec::Claude, Some("sk-ant".into()))
            .unwrap());
        assert_eq!(h.controller.generation(), gen(1));

        assert!(matches!(
            h.controller.select_model_by_name("qwen3:4b"),
            Err(RuntimeError::ModelNotDownloaded(_))
        ));
        assert!(matches!(
            h.controller.download_model("qwen3:4b"),
            Err(RuntimeError::Engine(_))
        ));
        assert!(matches!(
            h.controller.select_model_by_name("gpt-9"),
            Err(RuntimeError::UnknownModel(_))
        ));
    }

    #[test]
    fn agent_ready_replays_tool_intents_in_order() {
        let mut h = Harness::new().with_api_model();
        h.controller.set_builtin_tool("web_fetch", true).unwrap();
        h.controller.set_builtin_tool("web_search_duckduckgo", true).unwrap();
        h.controller.add_server("http://b/mcp").unwrap();
        h.controller.add_server("http://a/mcp").unwrap();
        h.controller.set_server_tool("http://b/mcp", "zeta", true).unwrap();
        h.controller.set_server_tool("http://b/mcp", "alpha", true).unwrap();
        h.controller.set_server_tool("http://a/mcp", "only", true).unwrap();
        assert!(h.sent().is_empty());

        h.controller.on_worker_ready().unwrap();
        let sent = h.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], WorkerCommand::AddExternalServer { url: "http://b/mcp".into() });

        let tools = |names: &[&str]| {
            names
                .iter()
                .map(|n| ToolDesc::new(*n, "", json!({})))
                .collect::<Vec<_>>()
        };
        h.controller.handle_event(WorkerEvent::ExternalServerRegistered {
            url: "http://b/mcp".into(),
            tools: tools(&["alpha", "beta", "zeta"]),
        });
        assert!(h.sent().is_empty());

        h.controller.handle_event(WorkerEvent::AgentReady { generation: gen(1) });
        let fetch_config = RuntimeConfig::default().builtin_tool_config("web_fetch");
        let search_config = RuntimeConfig::default().builtin_tool_config("web_search_duckduckgo");
        assert_eq!(
            h.sent(),
            vec![
                WorkerCommand::ClearTools,
                WorkerCommand::AddBuiltinTool {
                    name: "web_fetch".into(),
                    config: fetch_config
                },
                WorkerCommand::AddBuiltinTool {
                    name: "web_search_duckduckgo".into(),
                    config: search_config
                },
                WorkerCommand::AddExternalTool {
                    url: "http://b/mcp".into(),
                    name: "alpha".into()
                },
                WorkerCommand::AddExternalTool {
                    url: "http://b/mcp".into(),
                    name: "zeta".into()
                },
            ]
        );

        // A server registering after ready gets its selection applied then.
        h.controller.handle_event(WorkerEvent::ExternalServerRegistered {
            url: "http://a/mcp".into(),
            tools: tools(&["only"]),
        });
        assert_eq!(
            h.sent(),
            vec![WorkerCommand::AddExternalTool {
                url: "http://a/mcp".into(),
                name: "only".into()
            }]
        );
        assert_eq!(h.controller.servers()[1].tools.len(), 1);
    }

    #[test]
    fn stale_generations_are_ignored() {
        let mut h = Harness::new().with_api_model().ready();
        h.controller.set_api_key(ApiSpec::OpenAI, Some("sk-new".into())).unwrap();
        assert_eq!(h.controller.generation(), gen(2));
        assert_eq!(h.controller.state(), SessionState::Provisioning);

        assert!(h
            .controller
            .handle_event(WorkerEvent::AgentReady { generation: gen(1) })
            .is_none());
        assert!(h
            .controller
            .handle_event(WorkerEvent::error(Some(gen(1)), ErrorScope::Provisioning, "old"))
            .is_none());
        assert_eq!(h.controller.state(), SessionState::Provisioning);

        let progress = CacheProgress { current: 1, total: 2 };
        assert!(matches!(
            h.controller.handle_event(WorkerEvent::ModelInitProgress {
                generation: gen(2),
                progress
            }),
            Some(AgentEvent::Progress { .. })
        ));
        assert_eq!(h.controller.progress(), Some(progress));
    }

    #[test]
    fn provisioning_failure_moves_to_error() {
        let mut h = Harness::new().with_api_model();
        h.controller.on_worker_ready().unwrap();
        let event = h.controller.handle_event(WorkerEvent::error(
            Some(gen(1)),
            ErrorScope::Provisioning,
            "invalid credential",
        ));
        assert!(matches!(event, Some(AgentEvent::Failed(RuntimeError::Provisioning(_)))));
        assert_eq!(h.controller.state(), SessionState::Error);
        assert_eq!(
            h.controller.check_can_run(),
            Err(RunPreconditionError::NotReady(SessionState::Error))
        );
    }

    #[test]
    fn runs_are_serialized_and_prefixed_with_system_prompt() {
        let mut h = Harness::new().with_api_model().ready();
        h.controller.set_system_prompt("Be brief.").unwrap();
        h.controller.set_reasoning(false).unwrap();

        assert!(matches!(
            h.controller.run(Vec::new()),
            Err(RuntimeError::RunPrecondition(RunPreconditionError::EmptyHistory))
        ));

        h.controller.run(vec![Message::user("Hello")]).unwrap();
        match h.sent().pop().unwrap() {
            WorkerCommand::RunAgent {
                generation,
                messages,
                agent_run_config,
            } => {
                assert_eq!(generation, gen(1));
                assert_eq!(messages, vec![Message::system("Be brief."), Message::user("Hello")]);
                assert_eq!(agent_run_config.think_effort(), Some(ThinkEffort::Disable));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            h.controller.run(vec![Message::user("again")]),
            Err(RuntimeError::RunPrecondition(RunPreconditionError::RunActive))
        ));

        let delta = MessageDeltaOutput::finished(MessageDelta::text(Role::Assistant, "Hi"), FinishReason::Stop);
        assert!(matches!(
            h.controller.handle_event(WorkerEvent::AgentStreamDelta {
                generation: gen(1),
                output: delta
            }),
            Some(AgentEvent::Delta(_))
        ));
        assert!(matches!(
            h.controller.handle_event(WorkerEvent::AgentStreamFinished { generation: gen(1) }),
            Some(AgentEvent::RunFinished)
        ));
        assert!(h.controller.check_can_run().is_ok());
    }

    #[test]
    fn removing_a_server_drops_its_selections() {
        let mut h = Harness::new().with_api_model().ready();
        h.controller.add_server("http://a/mcp").unwrap();
        h.controller.handle_event(WorkerEvent::ExternalServerRegistered {
            url: "http://a/mcp".into(),
            tools: vec![ToolDesc::new("add", "", json!({}))],
        });
        h.controller.set_server_tool("http://a/mcp", "add", true).unwrap();
        assert!(matches!(
            h.controller.set_server_tool("http://a/mcp", "mul", true),
            Err(RuntimeError::UnknownTool(_))
        ));
        h.sent();

        h.controller.remove_server("http://a/mcp").unwrap();
        assert_eq!(
            h.sent(),
            vec![WorkerCommand::RemoveExternalServer { url: "http://a/mcp".into() }]
        );
        assert!(h.controller.servers().is_empty());
        assert_eq!(h.controller.server_status("http://a/mcp"), None);

        // Re-adding starts with no selections.
        h.controller.add_server("http://a/mcp").unwrap();
        assert!(h.controller.servers()[0].selected.is_empty());
        assert!(matches!(
            h.controller.remove_server("http://nope"),
            Err(RuntimeError::UnknownServer(_))
        ));
    }

    #[test]
    fn failed_registration_keeps_the_server() {
        let mut h = Harness::new();
        h.controller.add_server("http://down/mcp").unwrap();
        h.controller.on_worker_ready().unwrap();

        let event = h.controller.handle_event(WorkerEvent::error(
            None,
            ErrorScope::ExternalServer {
                url: "http://down/mcp".into(),
            },
            "connection refused",
        ));
        assert!(matches!(
            event,
            Some(AgentEvent::Failed(RuntimeError::ExternalServer { .. }))
        ));
        assert_eq!(h.controller.server_status("http://down/mcp"), Some(ServerStatus::Failed));
        assert_eq!(h.controller.servers().len(), 1);
        assert_eq!(h.store.load::<Vec<ExternalServerRecord>>(key::EXTERNAL_SERVERS, Vec::new()).len(), 1);
    }

    #[test]
    fn builtin_selection_while_ready_is_sent_immediately() {
        let mut h = Harness::new().with_api_model().ready();
        h.controller.set_builtin_tool("web_fetch", true).unwrap();
        h.controller.set_builtin_tool("web_fetch", true).unwrap();
        h.controller.set_builtin_tool("web_fetch", false).unwrap();
        assert_eq!(
            h.sent(),
            vec![
                WorkerCommand::AddBuiltinTool {
                    name: "web_fetch".into(),
                    config: json!({})
                },
                WorkerCommand::RemoveTool {
                    name: "web_fetch".into(),
                    url: None
                },
            ]
        );
        assert!(matches!(
            h.controller.set_builtin_tool("calculator", true),
            Err(RuntimeError::UnknownTool(_))
        ));
    }
}
