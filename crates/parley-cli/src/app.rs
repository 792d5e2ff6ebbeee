//! REPL state: executes commands against the runtime and prints events.
//!
//! Streaming text is printed incrementally: the app remembers how much of
//! the ongoing message it has already written and prints only the new
//! suffix on every delta.

use std::io::Write;
use std::path::Path;

use parley_core::{Message, Part, Role, ThreadId};
use parley_engine::{CacheProgress, ModelSource, API_MODELS, BUILTIN_TOOLS, LOCAL_MODELS};
use parley_runtime::{AppendMessage, ChatRuntime, RuntimeError, RuntimeEvent, ServerStatus};
use parley_store::{RocksStore, Thread};

use crate::command::{self, Command, HELP};

/// Characters of a tool result shown inline.
const TOOL_PREVIEW_CHARS: usize = 200;

/// Characters of a thread id shown in listings.
const SHORT_ID_LEN: usize = 8;

/// The interactive session.
pub struct App {
    runtime: ChatRuntime<RocksStore>,
    /// Bytes of the ongoing message's text already printed.
    printed: usize,
    last_percent: Option<u64>,
    /// Set by `/quit`.
    pub should_quit: bool,
}

impl App {
    /// Wrap a started runtime.
    pub const fn new(runtime: ChatRuntime<RocksStore>) -> Self {
        Self {
            runtime,
            printed: 0,
            last_percent: None,
            should_quit: false,
        }
    }

    /// Mutable access for the event loop.
    pub fn runtime_mut(&mut self) -> &mut ChatRuntime<RocksStore> {
        &mut self.runtime
    }

    /// Print where the session stands after startup.
    pub fn print_banner(&self) {
        println!("parley {} - type /help for commands", env!("CARGO_PKG_VERSION"));
        match self.runtime.controller().selected_model() {
            Some(model) => println!("[model: {} ({})]", model.model_name(), self.runtime.session_state()),
            None => println!("[no model selected - try /models]"),
        }
        if let Some(id) = self.runtime.current_thread() {
            if let Ok(Some(thread)) = self.runtime.threads().map(|t| t.into_iter().find(|t| t.thread_id == id)) {
                println!("[thread {} \"{}\", {} messages]", short_id(id), thread.title, thread.message_count);
            }
        }
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Parse and execute one input line, printing any failure.
    pub async fn handle_line(&mut self, line: &str) {
        let command = match command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                println!("{e}");
                return;
            }
        };
        tracing::debug!(?command, "Executing command");

        if let Err(e) = self.execute(command).await {
            println!("error: {e}");
        }
    }

    async fn execute(&mut self, command: Command) -> parley_runtime::Result<()> {
        match command {
            Command::Say(text) => self.runtime.on_new(AppendMessage::text(text))?,
            Command::Help => println!("{HELP}"),
            Command::Quit => self.should_quit = true,

            // Models
            Command::Models => self.print_models(),
            Command::Model(name) => {
                let sent = self.runtime.configure(|agent| agent.select_model_by_name(&name))?;
                self.report_selection(&name, sent);
            }
            Command::Key { spec, key } => {
                let cleared = key.is_none();
                self.runtime.configure(|agent| agent.set_api_key(spec, key))?;
                println!("[{spec} key {}]", if cleared { "cleared" } else { "stored" });
            }
            Command::Download(name) => {
                let sent = self.runtime.configure(|agent| agent.download_model(&name))?;
                self.report_selection(&name, sent);
            }
            Command::RemoveModel(name) => {
                self.runtime.remove_model(&name).await?;
                println!("[removed {name}]");
            }

            // Tools
            Command::Tools => self.print_tools(),
            Command::Tool { id, enabled } => {
                self.runtime.configure(|agent| agent.set_builtin_tool(&id, enabled))?;
            }
            Command::Servers => self.print_servers(),
            Command::ServerAdd(url) => {
                self.runtime.configure(|agent| agent.add_server(&url))?;
                println!("[connecting to {url}]");
            }
            Command::ServerRemove(url) => self.runtime.configure(|agent| agent.remove_server(&url))?,
            Command::ServerTool { url, name, enabled } => {
                self.runtime
                    .configure(|agent| agent.set_server_tool(&url, &name, enabled))?;
            }

            // Run options
            Command::System(prompt) => self.runtime.configure(|agent| agent.set_system_prompt(&prompt))?,
            Command::Reasoning(enabled) => self.runtime.configure(|agent| agent.set_reasoning(enabled))?,

            // Threads
            Command::Threads => self.print_threads()?,
            Command::New => {
                let thread = self.runtime.new_thread()?;
                println!("[new thread {}]", short_id(thread.thread_id));
            }
            Command::Switch(prefix) => {
                let id = self.resolve_thread(&prefix)?;
                self.runtime.switch_thread(id)?;
                self.print_history();
            }
            Command::Rename(title) => {
                let id = self.runtime.current_thread().ok_or(RuntimeError::NoThread)?;
                self.runtime.rename_thread(id, &title)?;
            }
            Command::Delete(prefix) => {
                let id = self.resolve_thread(&prefix)?;
                self.runtime.delete_thread(id)?;
                println!("[deleted {}]", short_id(id));
            }
            Command::History => self.print_history(),

            // Turns
            Command::Edit { index, text } => self.runtime.on_edit(index, AppendMessage::text(text))?,
            Command::Reload(index) => self.runtime.on_reload(index)?,
            Command::Image { path, text } => {
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| RuntimeError::Command(format!("{}: {e}", path.display())))?;
                let turn = AppendMessage::text(text).with_image(file_name(&path), data);
                self.runtime.on_new(turn)?;
            }
        }
        Ok(())
    }

    fn report_selection(&self, name: &str, sent: bool) {
        if sent {
            println!("[loading {name}]");
        } else if self.runtime.controller().local_supported() {
            println!("[selected {name}; set its API key with /key to load it]");
        } else {
            println!("[selected {name}; waiting for an API key or the local model server]");
        }
    }

    fn resolve_thread(&self, prefix: &str) -> parley_runtime::Result<ThreadId> {
        let threads = self.runtime.threads()?;
        resolve_prefix(&threads, prefix).map_err(RuntimeError::Command)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Render one runtime event.
    pub fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Provisioning { generation } => {
                tracing::debug!(%generation, "Provisioning");
                self.last_percent = None;
            }
            RuntimeEvent::Progress { progress, .. } => self.print_progress(progress),
            RuntimeEvent::AgentReady { .. } => {
                self.last_percent = None;
                if let Some(model) = self.runtime.controller().selected_model() {
                    println!("[ready: {}]", model.model_name());
                }
            }
            RuntimeEvent::ServerRegistered { url, tools } => {
                println!("[{url}: {} tools]", tools.len());
            }
            RuntimeEvent::Delta { .. } => {
                if let Some(ongoing) = self.runtime.ongoing() {
                    self.print_suffix(&ongoing.text());
                }
            }
            RuntimeEvent::MessageFinalized { thread_id, message } => {
                if self.runtime.current_thread() == Some(thread_id) {
                    self.print_finalized(&message);
                }
                self.printed = 0;
            }
            RuntimeEvent::RunFinished { .. } => self.printed = 0,
            RuntimeEvent::Error(e) => {
                self.end_line();
                println!("error: {e}");
            }
            RuntimeEvent::ThreadsChanged | RuntimeEvent::ThreadSwitched { .. } => {}
        }
    }

    fn print_suffix(&mut self, text: &str) {
        let Some(suffix) = text.get(self.printed..) else {
            return;
        };
        if suffix.is_empty() {
            return;
        }
        print!("{suffix}");
        let _ = std::io::stdout().flush();
        self.printed = text.len();
    }

    fn end_line(&mut self) {
        if self.printed > 0 {
            println!();
            self.printed = 0;
        }
    }

    fn print_finalized(&mut self, message: &Message) {
        match message.role {
            Role::Assistant => {
                self.print_suffix(&message.text());
                self.end_line();
                for call in &message.tool_calls {
                    if let Part::Function { name, arguments, .. } = call {
                        println!("[calling {name} {arguments}]");
                    }
                }
            }
            Role::Tool => println!("[tool result] {}", preview(&message.text(), TOOL_PREVIEW_CHARS)),
            Role::User | Role::System => {}
        }
    }

    fn print_progress(&mut self, progress: CacheProgress) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = (progress.fraction() * 100.0) as u64;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            println!("[downloading {percent}%]");
        }
    }

    // =========================================================================
    // Listings
    // =========================================================================

    fn print_models(&self) {
        let agent = self.runtime.controller();
        let selected = agent.selected_model();
        let downloaded = agent.downloaded_models();
        let keys = agent.api_keys();

        for model in LOCAL_MODELS.iter().chain(API_MODELS.iter()) {
            let marker = if selected.as_ref().map(|m| m.model_name()) == Some(model.name) {
                '*'
            } else {
                ' '
            };
            let note = match model.source {
                ModelSource::Local if downloaded.iter().any(|d| d == model.name) => "local, downloaded".to_string(),
                ModelSource::Local if agent.local_supported() => "local".to_string(),
                ModelSource::Local => "local, server unavailable".to_string(),
                ModelSource::Api(spec) if keys.get(spec).is_some() => format!("{spec}"),
                ModelSource::Api(spec) => format!("{spec}, no key"),
            };
            println!("{marker} {:<20} {note}", model.name);
        }
    }

    fn print_tools(&self) {
        let enabled = self.runtime.controller().builtin_tools();
        for tool in &BUILTIN_TOOLS {
            let state = if enabled.iter().any(|id| id == tool.id) { "on " } else { "off" };
            println!("{state} {:<24} {}", tool.id, tool.description);
        }
    }

    fn print_servers(&self) {
        let agent = self.runtime.controller();
        let servers = agent.servers();
        if servers.is_empty() {
            println!("[no servers]");
        }
        for server in servers {
            let status = match agent.server_status(&server.url) {
                Some(ServerStatus::Ready) => "connected",
                Some(ServerStatus::Registering) => "connecting",
                Some(ServerStatus::Failed) => "failed",
                None => "idle",
            };
            println!("{} ({status})", server.url);
            for tool in &server.tools {
                let state = if server.is_selected(&tool.name) { "on " } else { "off" };
                println!("  {state} {}", tool.name);
            }
        }
    }

    fn print_threads(&self) -> parley_runtime::Result<()> {
        let current = self.runtime.current_thread();
        for thread in self.runtime.threads()? {
            let marker = if Some(thread.thread_id) == current { '*' } else { ' ' };
            println!(
                "{marker} {}  {}  {:<30} {} messages",
                short_id(thread.thread_id),
                thread.updated_at.format("%Y-%m-%d %H:%M"),
                thread.title,
                thread.message_count,
            );
        }
        Ok(())
    }

    fn print_history(&self) {
        for (index, message) in self.runtime.messages().iter().enumerate() {
            let images = message
                .contents
                .iter()
                .filter(|p| matches!(p, Part::Image { .. }))
                .count();
            let mut line = format!("[{index}] {}: {}", message.role, message.text());
            if images > 0 {
                line.push_str(&format!(" ({images} image{})", if images == 1 { "" } else { "s" }));
            }
            if message.role == Role::Tool {
                line = format!("[{index}] tool: {}", preview(&message.text(), TOOL_PREVIEW_CHARS));
            }
            println!("{line}");
            for call in &message.tool_calls {
                if let Part::Function { name, .. } = call {
                    println!("    -> {name}");
                }
            }
        }
    }
}

/// Find the single thread whose id starts with `prefix`.
fn resolve_prefix(threads: &[Thread], prefix: &str) -> Result<ThreadId, String> {
    let prefix = prefix.trim().to_ascii_lowercase();
    let mut matches = threads
        .iter()
        .filter(|t| t.thread_id.to_string().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(thread), None) => Ok(thread.thread_id),
        (None, _) => Err(format!("no thread matches {prefix}")),
        (Some(_), Some(_)) => Err(format!("{prefix} matches more than one thread")),
    }
}

fn short_id(id: ThreadId) -> String {
    id.to_string().chars().take(SHORT_ID_LEN).collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
