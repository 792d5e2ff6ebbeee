//! Agent configuration: model binding, credentials and run options.
//!
//! Field names follow the persisted camelCase shape so values written by
//! earlier releases keep loading.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A hosted provider speaking the chat-completions protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApiSpec {
    /// OpenAI.
    OpenAI,
    /// Google Gemini.
    Gemini,
    /// Anthropic Claude.
    Claude,
    /// xAI Grok.
    Grok,
}

impl ApiSpec {
    /// Every supported provider.
    pub const ALL: [Self; 4] = [Self::OpenAI, Self::Gemini, Self::Claude, Self::Grok];

    /// Return the provider name as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Claude => "Claude",
            Self::Grok => "Grok",
        }
    }
}

impl std::fmt::Display for ApiSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApiSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|spec| spec.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// The selected language-model binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum LmConfig {
    /// A model served locally; weights must be downloaded first.
    Local {
        /// Model name as known to the local model server.
        model_name: String,
    },
    /// A model reached through a hosted API.
    Api {
        /// The provider.
        spec: ApiSpec,
        /// Model name as known to the provider.
        model_name: String,
    },
}

impl LmConfig {
    /// Return the model name.
    #[must_use]
    pub fn model_name(&self) -> &str {
        match self {
            Self::Local { model_name } | Self::Api { model_name, .. } => model_name,
        }
    }

    /// Return true for locally served models.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

/// API credentials keyed by provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKeys(BTreeMap<ApiSpec, String>);

impl ApiKeys {
    /// Return the non-empty credential for `spec`.
    #[must_use]
    pub fn get(&self, spec: ApiSpec) -> Option<&str> {
        self.0
            .get(&spec)
            .map(String::as_str)
            .filter(|key| !key.trim().is_empty())
    }

    /// Set or clear the credential for `spec`. Empty keys clear.
    pub fn set(&mut self, spec: ApiSpec, key: Option<String>) {
        match key.filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                self.0.insert(spec, key);
            }
            None => {
                self.0.remove(&spec);
            }
        }
    }
}

/// Whether, and how hard, the model should reason before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkEffort {
    /// Reasoning on, provider default effort.
    Enable,
    /// Reasoning off.
    Disable,
    /// Low effort.
    Low,
    /// Medium effort.
    Medium,
    /// High effort.
    High,
}

/// Sampling options for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    /// Reasoning effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_effort: Option<ThinkEffort>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling mass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Upper bound on generated tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Options applied to every run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Sampling options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceConfig>,
}

impl RunConfig {
    /// Return the configured reasoning effort.
    #[must_use]
    pub fn think_effort(&self) -> Option<ThinkEffort> {
        self.inference.as_ref().and_then(|i| i.think_effort)
    }

    /// Set the reasoning effort, keeping other inference options.
    pub fn set_think_effort(&mut self, effort: ThinkEffort) {
        self.inference.get_or_insert_with(InferenceConfig::default).think_effort = Some(effort);
    }
}
