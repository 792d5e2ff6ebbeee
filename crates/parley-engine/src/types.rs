//! Engine configuration and catalog types.

use parley_core::{ApiSpec, LmConfig};
use serde::{Deserialize, Serialize};

/// Byte progress of a model download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheProgress {
    /// Bytes fetched so far.
    pub current: u64,
    /// Total bytes expected.
    pub total: u64,
}

impl CacheProgress {
    /// Fraction complete in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64).min(1.0)
        }
    }
}

/// Where a catalog model runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    /// Served by the local model server.
    Local,
    /// Served by a hosted provider.
    Api(ApiSpec),
}

/// A model offered for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Model name sent to the backend.
    pub name: &'static str,
    /// Where it runs.
    pub source: ModelSource,
}

impl ModelInfo {
    /// Return the binding that selects this model.
    #[must_use]
    pub fn config(&self) -> LmConfig {
        match self.source {
            ModelSource::Local => LmConfig::Local {
                model_name: self.name.to_string(),
            },
            ModelSource::Api(spec) => LmConfig::Api {
                spec,
                model_name: self.name.to_string(),
            },
        }
    }
}

/// Models that run on the local model server.
pub const LOCAL_MODELS: [ModelInfo; 4] = [
    ModelInfo {
        name: "qwen3:0.6b",
        source: ModelSource::Local,
    },
    ModelInfo {
        name: "qwen3:1.7b",
        source: ModelSource::Local,
    },
    ModelInfo {
        name: "qwen3:4b",
        source: ModelSource::Local,
    },
    ModelInfo {
        name: "qwen3:8b",
        source: ModelSource::Local,
    },
];

/// Models reached through hosted APIs.
pub const API_MODELS: [ModelInfo; 4] = [
    ModelInfo {
        name: "gpt-5.2",
        source: ModelSource::Api(ApiSpec::OpenAI),
    },
    ModelInfo {
        name: "gemini-2.5-flash",
        source: ModelSource::Api(ApiSpec::Gemini),
    },
    ModelInfo {
        name: "claude-sonnet-4-5",
        source: ModelSource::Api(ApiSpec::Claude),
    },
    ModelInfo {
        name: "grok-4-fast",
        source: ModelSource::Api(ApiSpec::Grok),
    },
];

/// Find a catalog model by name.
#[must_use]
pub fn find_model(name: &str) -> Option<ModelInfo> {
    LOCAL_MODELS
        .iter()
        .chain(API_MODELS.iter())
        .find(|m| m.name == name)
        .copied()
}

/// Base URLs of the hosted providers' chat-completions endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    /// OpenAI.
    #[serde(default = "ProviderEndpoints::default_openai")]
    pub openai: String,
    /// Gemini's OpenAI-compatible endpoint.
    #[serde(default = "ProviderEndpoints::default_gemini")]
    pub gemini: String,
    /// Claude's OpenAI-compatible endpoint.
    #[serde(default = "ProviderEndpoints::default_claude")]
    pub claude: String,
    /// Grok.
    #[serde(default = "ProviderEndpoints::default_grok")]
    pub grok: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai: Self::default_openai(),
            gemini: Self::default_gemini(),
            claude: Self::default_claude(),
            grok: Self::default_grok(),
        }
    }
}

impl ProviderEndpoints {
    fn default_openai() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_gemini() -> String {
        "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
    }

    fn default_claude() -> String {
        "https://api.anthropic.com/v1".to_string()
    }

    fn default_grok() -> String {
        "https://api.x.ai/v1".to_string()
    }

    /// Return the base URL for `spec`.
    #[must_use]
    pub fn base_url(&self, spec: ApiSpec) -> &str {
        match spec {
            ApiSpec::OpenAI => &self.openai,
            ApiSpec::Gemini => &self.gemini,
            ApiSpec::Claude => &self.claude,
            ApiSpec::Grok => &self.grok,
        }
    }

    /// Point every provider at `base_url`.
    #[must_use]
    pub fn uniform(base_url: &str) -> Self {
        Self {
            openai: base_url.to_string(),
            gemini: base_url.to_string(),
            claude: base_url.to_string(),
            grok: base_url.to_string(),
        }
    }
}
