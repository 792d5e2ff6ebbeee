//! The chat runtime: threads, turns and the ongoing message.
//!
//! A run is bound to the thread that was current when it started. Deltas
//! fold into a single ongoing slot; the terminal delta of each message
//! finalizes it, appends it to the run's thread and clears the slot in one
//! step.

use std::sync::Arc;

use parley_core::{AccumulatedState, Generation, Message, MessageDeltaOutput, SessionState, ThreadId};
use parley_store::{migrate_legacy_settings, RocksStore, Store, StoreError, Thread};
use parley_worker::{spawn_worker, WorkerEvent, WorkerReceiver, WorkerSender, WorkerThread};
use tokio::sync::broadcast;

use crate::config::RuntimeConfig;
use crate::controller::{AgentController, AgentEvent};
use crate::convert::AppendMessage;
use crate::error::{Result, RunPreconditionError, RuntimeError};
use crate::events::RuntimeEvent;

const EVENT_CAPACITY: usize = 256;

/// Bridges the thread store, the agent controller and the delta stream.
pub struct ChatRuntime<S: Store + ?Sized> {
    store: Arc<S>,
    controller: AgentController<S>,
    worker: WorkerReceiver,
    events: broadcast::Sender<RuntimeEvent>,

    current: Option<ThreadId>,
    history: Vec<Message>,

    run_thread: Option<ThreadId>,
    ongoing: Option<AccumulatedState>,
    discarding: bool,
}

impl ChatRuntime<RocksStore> {
    /// Open the database, spawn a worker thread talking to real providers
    /// and start the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the worker
    /// cannot be started.
    pub async fn launch(config: RuntimeConfig) -> Result<(Self, WorkerThread)> {
        let store = Arc::new(RocksStore::open(config.db_path())?);
        let http = config.http_client()?;
        let (sender, receiver, thread) = spawn_worker(config.worker_deps(&http))?;
        let runtime = Self::start(store, config, &http, sender, receiver).await?;
        Ok((runtime, thread))
    }
}

impl<S: Store + ?Sized> ChatRuntime<S> {
    /// Start the runtime over a running worker.
    ///
    /// Migrates legacy settings, checks the local model server, waits for
    /// `worker-ready`, re-registers persisted servers and provisions the
    /// selected model if it is eligible. The most recently updated thread
    /// becomes current.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Transport` if the worker stops before it is
    /// ready, or a storage error.
    pub async fn start(
        store: Arc<S>,
        config: RuntimeConfig,
        http: &reqwest::Client,
        sender: WorkerSender,
        mut worker: WorkerReceiver,
    ) -> Result<Self> {
        migrate_legacy_settings(store.as_ref())?;

        let mut controller = AgentController::new(Arc::clone(&store), config, http, sender);
        controller.check_local().await;

        loop {
            match worker.recv().await {
                Some(WorkerEvent::WorkerReady) => break,
                Some(other) => tracing::debug!(?other, "Event before worker-ready"),
                None => {
                    return Err(RuntimeError::Transport(
                        "worker stopped before it was ready".to_string(),
                    ))
                }
            }
        }
        controller.on_worker_ready()?;

        let current = store.list_threads()?.first().map(|t| t.thread_id);
        let history = match &current {
            Some(id) => store.messages(id)?,
            None => Vec::new(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(current_thread = ?current, "Chat runtime started");
        Ok(Self {
            store,
            controller,
            worker,
            events,
            current,
            history,
            run_thread: None,
            ongoing: None,
            discarding: false,
        })
    }

    /// Observe every event returned by [`next_event`](Self::next_event) and
    /// every local change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // View
    // =========================================================================

    /// The current thread's finalized messages followed by the ongoing
    /// message, if the active run writes to this thread.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self.history.clone();
        if self.run_thread.is_some() && self.run_thread == self.current {
            if let Some(state) = &self.ongoing {
                messages.push(state.snapshot());
            }
        }
        messages
    }

    /// The in-progress message, if any.
    #[must_use]
    pub fn ongoing(&self) -> Option<Message> {
        self.ongoing.as_ref().map(AccumulatedState::snapshot)
    }

    /// Returns true while a run is answering.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.run_thread.is_some()
    }

    /// Returns true while new turns cannot be sent.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        !self.controller.is_ready()
    }

    /// Mirrored session state.
    #[must_use]
    pub const fn session_state(&self) -> SessionState {
        self.controller.state()
    }

    /// The current thread.
    #[must_use]
    pub const fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    /// The agent controller, for reading settings.
    #[must_use]
    pub const fn controller(&self) -> &AgentController<S> {
        &self.controller
    }

    /// Change agent settings. A change that reprovisions abandons the
    /// active run.
    ///
    /// # Errors
    ///
    /// Returns whatever `change` returns.
    pub fn configure<T>(&mut self, change: impl FnOnce(&mut AgentController<S>) -> Result<T>) -> Result<T> {
        let before = self.controller.generation();
        let result = change(&mut self.controller);
        let generation = self.controller.generation();
        if generation != before {
            self.abandon_run();
            self.publish(RuntimeEvent::Provisioning { generation });
        }
        result
    }

    /// Delete a local model's weights.
    ///
    /// # Errors
    ///
    /// Returns an error if the local model server refuses the deletion.
    pub async fn remove_model(&mut self, name: &str) -> Result<()> {
        self.controller.remove_model(name).await
    }

    // =========================================================================
    // Turns
    // =========================================================================

    /// Send a new user turn in the current thread, creating one if needed.
    ///
    /// The run is handed to the worker before anything is stored.
    ///
    /// # Errors
    ///
    /// Returns a `RunPrecondition` error unless the session is ready and
    /// idle and the turn starts with text, or an error if the worker channel
    /// is closed. Nothing is stored on error.
    pub fn on_new(&mut self, turn: AppendMessage) -> Result<()> {
        self.controller.check_can_run()?;
        let message = turn.into_message()?;

        let mut history = match &self.current {
            Some(id) => self.store.messages(id)?,
            None => Vec::new(),
        };
        history.push(message.clone());
        let generation = self.controller.run(history)?;

        let thread_id = match self.current {
            Some(id) => id,
            None => self.create_and_switch()?.thread_id,
        };
        self.bind_run(generation, thread_id);

        self.store.append_message(&thread_id, &message)?;
        self.history.push(message);
        self.publish(RuntimeEvent::ThreadsChanged);
        Ok(())
    }

    /// Replace the turn at `index` and everything after it, then run.
    ///
    /// # Errors
    ///
    /// Returns a `RunPrecondition` error unless the session is ready and
    /// idle and the turn starts with text, or a storage error if `index` is
    /// past the end. The thread is left untouched on error.
    pub fn on_edit(&mut self, index: usize, turn: AppendMessage) -> Result<()> {
        self.controller.check_can_run()?;
        let message = turn.into_message()?;
        let thread_id = self.current.ok_or(RuntimeError::NoThread)?;

        let mut history = self.history_before(&thread_id, index)?;
        history.push(message.clone());
        let generation = self.controller.run(history)?;

        self.store.replace_messages_from(&thread_id, index, &[message])?;
        self.reload_history()?;
        self.publish(RuntimeEvent::ThreadsChanged);

        self.bind_run(generation, thread_id);
        Ok(())
    }

    /// Drop the message at `index` and everything after it, then run again.
    ///
    /// # Errors
    ///
    /// Returns `EmptyHistory` for index 0, another `RunPrecondition` error
    /// unless the session is ready and idle, or a storage error if `index`
    /// is past the end. The thread is left untouched on error.
    pub fn on_reload(&mut self, index: usize) -> Result<()> {
        self.controller.check_can_run()?;
        if index == 0 {
            return Err(RunPreconditionError::EmptyHistory.into());
        }
        let thread_id = self.current.ok_or(RuntimeError::NoThread)?;

        let history = self.history_before(&thread_id, index)?;
        let generation = self.controller.run(history)?;

        self.store.replace_messages_from(&thread_id, index, &[])?;
        self.reload_history()?;

        self.bind_run(generation, thread_id);
        Ok(())
    }

    /// The stored messages of `thread_id` before `index`.
    fn history_before(&self, thread_id: &ThreadId, index: usize) -> Result<Vec<Message>> {
        let mut history = self.store.messages(thread_id)?;
        if index > history.len() {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: history.len(),
            }
            .into());
        }
        history.truncate(index);
        Ok(history)
    }

    fn bind_run(&mut self, generation: Generation, thread_id: ThreadId) {
        self.run_thread = Some(thread_id);
        self.ongoing = None;
        self.discarding = false;
        tracing::debug!(%generation, thread_id = %thread_id, "Run started");
    }

    fn abandon_run(&mut self) {
        if let Some(thread_id) = self.run_thread.take() {
            tracing::debug!(thread_id = %thread_id, "Run abandoned");
        }
        self.ongoing = None;
        self.discarding = false;
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Every thread, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn threads(&self) -> Result<Vec<Thread>> {
        Ok(self.store.list_threads()?)
    }

    /// Create an empty thread and make it current.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn new_thread(&mut self) -> Result<Thread> {
        self.create_and_switch()
    }

    fn create_and_switch(&mut self) -> Result<Thread> {
        let thread = self.store.create_thread(None)?;
        self.current = Some(thread.thread_id);
        self.history.clear();
        self.publish(RuntimeEvent::ThreadsChanged);
        self.publish(RuntimeEvent::ThreadSwitched {
            thread_id: self.current,
        });
        Ok(thread)
    }

    /// Make `thread_id` current. An active run keeps writing to its own
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist.
    pub fn switch_thread(&mut self, thread_id: ThreadId) -> Result<()> {
        let history = self.store.messages(&thread_id)?;
        self.current = Some(thread_id);
        self.history = history;
        self.publish(RuntimeEvent::ThreadSwitched {
            thread_id: self.current,
        });
        Ok(())
    }

    /// Rename a thread.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist.
    pub fn rename_thread(&mut self, thread_id: ThreadId, title: &str) -> Result<()> {
        self.store.rename_thread(&thread_id, title)?;
        self.publish(RuntimeEvent::ThreadsChanged);
        Ok(())
    }

    /// Delete a thread. Deleting the current thread makes the most recent
    /// remaining one current.
    ///
    /// # Errors
    ///
    /// Returns `RunActive` for the thread an active run writes to, or
    /// `StoreError::NotFound` if the thread doesn't exist.
    pub fn delete_thread(&mut self, thread_id: ThreadId) -> Result<()> {
        if self.run_thread == Some(thread_id) {
            return Err(RunPreconditionError::RunActive.into());
        }
        self.store.delete_thread(&thread_id)?;
        self.publish(RuntimeEvent::ThreadsChanged);

        if self.current == Some(thread_id) {
            self.current = self.store.list_threads()?.first().map(|t| t.thread_id);
            self.reload_history()?;
            self.publish(RuntimeEvent::ThreadSwitched {
                thread_id: self.current,
            });
        }
        Ok(())
    }

    fn reload_history(&mut self) -> Result<()> {
        self.history = match &self.current {
            Some(id) => self.store.messages(id)?,
            None => Vec::new(),
        };
        Ok(())
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    /// Wait for the next worker event that changes something, apply it and
    /// return the change. Returns `None` once the worker has stopped.
    pub async fn next_event(&mut self) -> Option<RuntimeEvent> {
        loop {
            let event = self.worker.recv().await?;
            let Some(agent_event) = self.controller.handle_event(event) else {
                continue;
            };
            if let Some(event) = self.apply(agent_event) {
                self.publish(event.clone());
                return Some(event);
            }
        }
    }

    fn apply(&mut self, event: AgentEvent) -> Option<RuntimeEvent> {
        match event {
            AgentEvent::Progress { generation, progress } => {
                Some(RuntimeEvent::Progress { generation, progress })
            }
            AgentEvent::Ready { generation } => Some(RuntimeEvent::AgentReady { generation }),
            AgentEvent::ServerRegistered { url, tools } => {
                Some(RuntimeEvent::ServerRegistered { url, tools })
            }
            AgentEvent::Delta(output) => self.fold(output),
            AgentEvent::RunFinished => {
                let thread_id = self.run_thread.take()?;
                self.ongoing = None;
                self.discarding = false;
                Some(RuntimeEvent::RunFinished { thread_id })
            }
            AgentEvent::Failed(error) => {
                match &error {
                    RuntimeError::RunRejected(_) => self.abandon_run(),
                    RuntimeError::Run(_) => self.ongoing = None,
                    _ => {}
                }
                Some(RuntimeEvent::error(error))
            }
        }
    }

    fn fold(&mut self, output: MessageDeltaOutput) -> Option<RuntimeEvent> {
        let thread_id = self.run_thread?;
        let terminal = output.is_terminal();

        if self.discarding {
            self.discarding = !terminal;
            return None;
        }

        let mut state = self.ongoing.take().unwrap_or_default();
        if let Err(e) = state.apply(output.delta.clone()) {
            tracing::warn!(thread_id = %thread_id, error = %e, "Discarding malformed message");
            self.discarding = !terminal;
            return Some(RuntimeEvent::error(e));
        }

        if !terminal {
            self.ongoing = Some(state);
            return Some(RuntimeEvent::Delta { thread_id, output });
        }

        let message = match state.finalize() {
            Ok(message) => message,
            Err(e) => return Some(RuntimeEvent::error(e)),
        };
        if let Err(e) = self.store.append_message(&thread_id, &message) {
            return Some(RuntimeEvent::error(e));
        }
        if self.current == Some(thread_id) {
            self.history.push(message.clone());
        }
        Some(RuntimeEvent::MessageFinalized { thread_id, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ApiKeys, ApiSpec, LmConfig, Role};
    use parley_engine::{ScriptStep, ScriptedBackend, StaticConnector};
    use parley_store::{settings::key, SettingsExt};
    use parley_worker::{spawn_worker_task, WorkerDeps};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn ready_runtime(
        backend: &ScriptedBackend,
    ) -> (ChatRuntime<RocksStore>, TempDir, tokio::task::JoinHandle<()>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let mut keys = ApiKeys::default();
        keys.set(ApiSpec::Grok, Some("xai-test".into()));
        store.save(key::API_KEYS, &keys).unwrap();
        store
            .save(
                key::SELECTED_MODEL,
                &Some(LmConfig::Api {
                    spec: ApiSpec::Grok,
                    model_name: "grok-4-fast".into(),
                }),
            )
            .unwrap();

        let deps = WorkerDeps {
            backend: Arc::new(backend.clone()),
            connector: Arc::new(StaticConnector::new()),
            http: reqwest::Client::new(),
        };
        let (sender, receiver, task) = spawn_worker_task(deps);
        let config = RuntimeConfig {
            ollama_host: "http://127.0.0.1:9".into(),
            ..RuntimeConfig::default()
        };
        let mut runtime = ChatRuntime::start(store, config, &reqwest::Client::new(), sender, receiver)
            .await
            .unwrap();

        let event = next(&mut runtime).await;
        assert!(matches!(event, RuntimeEvent::AgentReady { .. }), "{event:?}");
        (runtime, dir, task)
    }

    async fn next(runtime: &mut ChatRuntime<RocksStore>) -> RuntimeEvent {
        tokio::time::timeout(Duration::from_secs(5), runtime.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("worker stopped")
    }

    #[tokio::test]
    async fn ongoing_message_is_visible_until_finalized() {
        let backend = ScriptedBackend::new();
        backend.push_run(vec![ScriptStep::text("H"), ScriptStep::finish("i there")]);
        let (mut runtime, _dir, _task) = ready_runtime(&backend).await;

        runtime.on_new(AppendMessage::text("Hello")).unwrap();
        assert!(runtime.is_running());

        assert!(matches!(next(&mut runtime).await, RuntimeEvent::Delta { .. }));
        let view = runtime.messages();
        assert_eq!(view.len(), 2);
        assert_eq!(view[1].text(), "H");

        match next(&mut runtime).await {
            RuntimeEvent::MessageFinalized { message, .. } => {
                assert_eq!(message.role, Role::Assistant);
                assert_eq!(message.text(), "Hi there");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(runtime.ongoing().is_none());
        assert!(matches!(next(&mut runtime).await, RuntimeEvent::RunFinished { .. }));
        assert!(!runtime.is_running());
        assert_eq!(runtime.messages().len(), 2);
    }

    #[tokio::test]
    async fn reload_at_zero_is_rejected() {
        let backend = ScriptedBackend::new();
        let (mut runtime, _dir, _task) = ready_runtime(&backend).await;
        assert!(matches!(
            runtime.on_reload(0),
            Err(RuntimeError::RunPrecondition(RunPreconditionError::EmptyHistory))
        ));
        assert!(matches!(runtime.on_edit(0, AppendMessage::text("x")), Err(RuntimeError::NoThread)));
    }

    #[tokio::test]
    async fn deleting_the_running_thread_is_refused() {
        let backend = ScriptedBackend::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        backend.push_run(vec![ScriptStep::WaitFor(Arc::clone(&gate)), ScriptStep::finish("done")]);
        let (mut runtime, _dir, _task) = ready_runtime(&backend).await;

        runtime.on_new(AppendMessage::text("Hello")).unwrap();
        let running = runtime.current_thread().unwrap();
        assert!(matches!(
            runtime.delete_thread(running),
            Err(RuntimeError::RunPrecondition(RunPreconditionError::RunActive))
        ));

        gate.notify_one();
        assert!(matches!(next(&mut runtime).await, RuntimeEvent::MessageFinalized { .. }));
        assert!(matches!(next(&mut runtime).await, RuntimeEvent::RunFinished { .. }));
        runtime.delete_thread(running).unwrap();
        assert_eq!(runtime.current_thread(), None);
        assert!(runtime.messages().is_empty());
    }

    #[tokio::test]
    async fn turns_are_not_stored_when_the_worker_is_gone() {
        let backend = ScriptedBackend::new();
        backend.push_run(vec![ScriptStep::finish("Hi")]);
        let (mut runtime, _dir, task) = ready_runtime(&backend).await;

        runtime.on_new(AppendMessage::text("Hello")).unwrap();
        assert!(matches!(next(&mut runtime).await, RuntimeEvent::MessageFinalized { .. }));
        assert!(matches!(next(&mut runtime).await, RuntimeEvent::RunFinished { .. }));
        let thread = runtime.current_thread().unwrap();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for result in [
            runtime.on_new(AppendMessage::text("Anyone?")),
            runtime.on_edit(0, AppendMessage::text("Hello again")),
            runtime.on_reload(1),
        ] {
            assert!(matches!(
                result,
                Err(RuntimeError::Worker(parley_worker::WorkerError::ChannelClosed))
            ));
        }

        let stored: Vec<_> = runtime.store.messages(&thread).unwrap().iter().map(Message::text).collect();
        assert_eq!(stored, vec!["Hello", "Hi"]);
        assert_eq!(runtime.messages().len(), 2);
        assert_eq!(runtime.threads().unwrap().len(), 1);
        assert!(!runtime.is_running());
    }
}
