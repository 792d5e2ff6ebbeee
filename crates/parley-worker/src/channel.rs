//! The controller's ends of the worker channel.
//!
//! Commands and events cross as JSON text frames over unbounded mpsc
//! channels; per-direction order is preserved.

use std::thread;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, WorkerError};
use crate::protocol::{ErrorScope, WorkerCommand, WorkerEvent};
use crate::worker::{AgentWorker, WorkerDeps};

/// Sends commands to the worker.
#[derive(Debug, Clone)]
pub struct WorkerSender {
    tx: mpsc::UnboundedSender<String>,
}

impl WorkerSender {
    /// Wrap the sending half of a command frame channel.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Serialize and send `command`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ChannelClosed` if the worker has stopped.
    pub fn send(&self, command: &WorkerCommand) -> Result<()> {
        let frame = serde_json::to_string(command)?;
        self.send_raw(frame)
    }

    /// Send an already encoded frame.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ChannelClosed` if the worker has stopped.
    pub fn send_raw(&self, frame: impl Into<String>) -> Result<()> {
        self.tx
            .send(frame.into())
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

/// Receives events from the worker.
#[derive(Debug)]
pub struct WorkerReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl WorkerReceiver {
    /// Wrap the receiving half of an event frame channel.
    #[must_use]
    pub const fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. Returns `None` once the worker has stopped.
    ///
    /// Frames that fail to decode are returned as transport errors.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        let frame = self.rx.recv().await?;
        Some(decode_event(&frame))
    }
}

/// Decode an event frame, mapping failures to a transport error event.
#[must_use]
pub fn decode_event(frame: &str) -> WorkerEvent {
    serde_json::from_str(frame).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Undecodable worker event");
        WorkerEvent::error(None, ErrorScope::Transport, e.to_string())
    })
}

/// Handle to a worker running on its own thread.
#[derive(Debug)]
pub struct WorkerThread {
    handle: thread::JoinHandle<()>,
}

impl WorkerThread {
    /// Wait for the worker thread to exit. It exits once every
    /// [`WorkerSender`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Spawn` if the thread panicked.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| WorkerError::Spawn("worker thread panicked".to_string()))
    }
}

fn channels() -> (
    WorkerSender,
    mpsc::UnboundedReceiver<String>,
    mpsc::UnboundedSender<String>,
    WorkerReceiver,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        WorkerSender::new(command_tx),
        command_rx,
        event_tx,
        WorkerReceiver::new(event_rx),
    )
}

/// Start a worker on a dedicated OS thread with its own tokio runtime.
///
/// # Errors
///
/// Returns `WorkerError::Spawn` if the thread cannot be started.
pub fn spawn_worker(deps: WorkerDeps) -> Result<(WorkerSender, WorkerReceiver, WorkerThread)> {
    let (sender, command_rx, event_tx, receiver) = channels();

    let handle = thread::Builder::new()
        .name("parley-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build worker runtime");
                    return;
                }
            };
            runtime.block_on(AgentWorker::new(deps, event_tx).run(command_rx));
        })
        .map_err(|e| WorkerError::Spawn(e.to_string()))?;

    Ok((sender, receiver, WorkerThread { handle }))
}

/// Start a worker as a task on the current tokio runtime.
#[must_use]
pub fn spawn_worker_task(deps: WorkerDeps) -> (WorkerSender, WorkerReceiver, JoinHandle<()>) {
    let (sender, command_rx, event_tx, receiver) = channels();
    let task = tokio::spawn(AgentWorker::new(deps, event_tx).run(command_rx));
    (sender, receiver, task)
}
