//! Events published to runtime observers.

use std::sync::Arc;

use parley_core::{Generation, Message, MessageDeltaOutput, ThreadId, ToolDesc};
use parley_engine::CacheProgress;

use crate::error::RuntimeError;

/// Something observable changed.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A provisioning request was sent.
    Provisioning {
        /// Generation of the request.
        generation: Generation,
    },
    /// Model download progress.
    Progress {
        /// Generation being provisioned.
        generation: Generation,
        /// Bytes fetched so far.
        progress: CacheProgress,
    },
    /// The session is ready for runs.
    AgentReady {
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
    /// The ongoing message grew.
    Delta {
        /// Thread the run writes to.
        thread_id: ThreadId,
        /// The folded delta.
        output: MessageDeltaOutput,
    },
    /// A message finished and was stored.
    MessageFinalized {
        /// Thread the message was appended to.
        thread_id: ThreadId,
        /// The stored message.
        message: Message,
    },
    /// The run ended; new turns are accepted.
    RunFinished {
        /// Thread the run wrote to.
        thread_id: ThreadId,
    },
    /// The thread list changed.
    ThreadsChanged,
    /// Another thread became current.
    ThreadSwitched {
        /// The current thread, if any.
        thread_id: Option<ThreadId>,
    },
    /// Something failed.
    Error(Arc<RuntimeError>),
}

impl RuntimeEvent {
    /// Wrap an error.
    #[must_use]
    pub fn error(error: impl Into<RuntimeError>) -> Self {
        Self::Error(Arc::new(error.into()))
    }
}
