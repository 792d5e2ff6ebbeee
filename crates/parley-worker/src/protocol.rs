//! Messages exchanged between the controller and the agent worker.
//!
//! Both directions are JSON objects tagged by `"type"` with kebab-case names
//! and camelCase fields.

use parley_core::{Generation, LmConfig, Message, MessageDeltaOutput, RunConfig, ToolDesc};
use parley_engine::CacheProgress;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    /// Provision a model served by the local model server.
    InitializeLocalAgent {
        /// Generation of this provisioning request.
        generation: Generation,
        /// Must be `LmConfig::Local`.
        config: LmConfig,
    },

    /// Provision a hosted model.
    InitializeApiAgent {
        /// Generation of this provisioning request.
        generation: Generation,
        /// Must be `LmConfig::Api`.
        config: LmConfig,
        /// Provider credential.
        api_key: String,
    },

    /// Unregister every tool.
    ClearTools,

    /// Register a built-in tool.
    AddBuiltinTool {
        /// Built-in tool id.
        name: String,
        /// Tool-specific configuration.
        #[serde(default)]
        config: Value,
    },

    /// Connect to an external tool server and discover its tools.
    AddExternalServer {
        /// Server URL.
        url: String,
    },

    /// Disconnect a server and unregister its tools.
    RemoveExternalServer {
        /// Server URL.
        url: String,
    },

    /// Register one tool of a connected server.
    AddExternalTool {
        /// Server URL.
        url: String,
        /// Tool name on that server.
        name: String,
    },

    /// Unregister one tool.
    RemoveTool {
        /// Tool name.
        name: String,
        /// Server URL for external tools.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },

    /// Start a run.
    RunAgent {
        /// Generation the caller believes is current.
        generation: Generation,
        /// Full history, system prompt first if any.
        messages: Vec<Message>,
        /// Run options.
        #[serde(default)]
        agent_run_config: RunConfig,
    },
}

impl WorkerCommand {
    /// Kebab-case name of this command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InitializeLocalAgent { .. } => "initialize-local-agent",
            Self::InitializeApiAgent { .. } => "initialize-api-agent",
            Self::ClearTools => "clear-tools",
            Self::AddBuiltinTool { .. } => "add-builtin-tool",
            Self::AddExternalServer { .. } => "add-external-server",
            Self::RemoveExternalServer { .. } => "remove-external-server",
            Self::AddExternalTool { .. } => "add-external-tool",
            Self::RemoveTool { .. } => "remove-tool",
            Self::RunAgent { .. } => "run-agent",
        }
    }
}

/// What an `error` event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ErrorScope {
    /// Model provisioning failed; the session is in `Error`.
    Provisioning,
    /// An active run failed; `agent-stream-finished` follows.
    Run,
    /// A run request was refused; no run started.
    RunRejected,
    /// Registering an external server failed.
    ExternalServer {
        /// Server URL.
        url: String,
    },
    /// A tool command failed.
    Tool,
    /// A command was inconsistent or not allowed.
    Command,
    /// A frame could not be decoded.
    Transport,
}

/// Events sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    /// The worker is accepting commands. Sent once, first.
    WorkerReady,

    /// Download progress of the model being provisioned.
    ModelInitProgress {
        /// Generation being provisioned.
        generation: Generation,
        /// Bytes fetched so far.
        progress: CacheProgress,
    },

    /// The model is bound and runs are accepted.
    AgentReady {
        /// Generation that became ready.
        generation: Generation,
    },

    /// An external server connected.
    ExternalServerRegistered {
        /// Server URL.
        url: String,
        /// Tools the server exposes.
        tools: Vec<ToolDesc>,
    },

    /// One delta of the active run.
    AgentStreamDelta {
        /// Generation of the run's model.
        generation: Generation,
        /// The delta.
        output: MessageDeltaOutput,
    },

    /// The active run has ended, successfully or not.
    AgentStreamFinished {
        /// Generation of the run's model.
        generation: Generation,
    },

    /// Something failed.
    Error {
        /// Generation the failure belongs to, when it has one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<Generation>,
        /// What failed.
        scope: ErrorScope,
        /// Human-readable description.
        message: String,
    },
}

impl WorkerEvent {
    /// Generation the event belongs to, if it carries one.
    #[must_use]
    pub const fn generation(&self) -> Option<Generation> {
        match self {
            Self::ModelInitProgress { generation, .. }
            | Self::AgentReady { generation }
            | Self::AgentStreamDelta { generation, .. }
            | Self::AgentStreamFinished { generation } => Some(*generation),
            Self::Error { generation, .. } => *generation,
            Self::WorkerReady | Self::ExternalServerRegistered { .. } => None,
        }
    }

    /// Build an error event.
    #[must_use]
    pub fn error(generation: Option<Generation>, scope: ErrorScope, message: impl Into<String>) -> Self {
        Self::Error {
            generation,
            scope,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{FinishReason, MessageDelta, Role};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn commands_use_kebab_case_tags_and_camel_case_fields() {
        let command = WorkerCommand::InitializeApiAgent {
            generation: Generation::new(3),
            config: LmConfig::Api {
                spec: parley_core::ApiSpec::Claude,
                model_name: "claude-sonnet-4-5".into(),
            },
            api_key: "sk".into(),
        };
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({
                "type": "initialize-api-agent",
                "generation": 3,
                "config": { "type": "api", "spec": "Claude", "modelName": "claude-sonnet-4-5" },
                "apiKey": "sk"
            })
        );
        assert_eq!(command.name(), "initialize-api-agent");
    }

    #[test]
    fn optional_fields_default() {
        let remove: WorkerCommand =
            serde_json::from_value(json!({ "type": "remove-tool", "name": "web_fetch" })).unwrap();
        assert_eq!(
            remove,
            WorkerCommand::RemoveTool {
                name: "web_fetch".into(),
                url: None
            }
        );

        let run: WorkerCommand = serde_json::from_value(json!({
            "type": "run-agent",
            "generation": 1,
            "messages": [{ "role": "user", "contents": [{ "type": "text", "text": "hi" }] }]
        }))
        .unwrap();
        assert!(matches!(run, WorkerCommand::RunAgent { ref agent_run_config, .. } if *agent_run_config == RunConfig::default()));
    }

    #[test]
    fn events_carry_generation_and_scope() {
        let delta = WorkerEvent::AgentStreamDelta {
            generation: Generation::new(2),
            output: MessageDeltaOutput::finished(
                MessageDelta::text(Role::Assistant, "x"),
                FinishReason::Stop,
            ),
        };
        assert_eq!(delta.generation(), Some(Generation::new(2)));

        let error = WorkerEvent::error(
            None,
            ErrorScope::ExternalServer {
                url: "http://tools".into(),
            },
            "refused",
        );
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({
                "type": "error",
                "scope": { "kind": "external-server", "url": "http://tools" },
                "message": "refused"
            })
        );
        assert_eq!(error.generation(), None);

        let ready: WorkerEvent = serde_json::from_str(r#"{"type":"worker-ready"}"#).unwrap();
        assert_eq!(ready, WorkerEvent::WorkerReady);
    }
}
