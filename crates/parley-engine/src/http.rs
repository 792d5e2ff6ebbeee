//! Production model backend.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{ApiSpec, LmConfig};

use crate::backend::{LanguageModel, ModelBackend, ProgressSink};
use crate::chat::ChatCompletionsModel;
use crate::error::{EngineError, Result};
use crate::ollama::OllamaClient;
use crate::types::ProviderEndpoints;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Provisions local models through the local model server and hosted models
/// through their providers' chat-completions endpoints.
#[derive(Debug, Clone)]
pub struct HttpModelBackend {
    client: reqwest::Client,
    ollama: OllamaClient,
    endpoints: ProviderEndpoints,
}

impl HttpModelBackend {
    /// Create a backend.
    #[must_use]
    pub fn new(client: reqwest::Client, ollama: OllamaClient, endpoints: ProviderEndpoints) -> Self {
        Self {
            client,
            ollama,
            endpoints,
        }
    }

    /// Check `api_key` against the provider's model listing.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidCredential` on 401/403, `EngineError::Api`
    /// on other failures and `EngineError::Network` if the provider is
    /// unreachable.
    pub async fn verify_credential(&self, spec: ApiSpec, api_key: &str) -> Result<()> {
        let url = format!(
            "{}/models",
            self.endpoints.base_url(spec).trim_end_matches('/')
        );
        let mut request = self.client.get(url).bearer_auth(api_key);
        if spec == ApiSpec::Claude {
            request = request
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION);
        }

        let response = request.send().await.map_err(|e| EngineError::network(&e))?;
        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(EngineError::InvalidCredential(spec)),
            code => Err(EngineError::Api {
                status: code,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    fn api_model(&self, spec: ApiSpec, model_name: &str, api_key: &str) -> ChatCompletionsModel {
        let model = ChatCompletionsModel::new(
            self.client.clone(),
            self.endpoints.base_url(spec),
            model_name,
        )
        .with_api_key(api_key);

        match spec {
            ApiSpec::OpenAI => model.with_max_tokens_field("max_completion_tokens"),
            ApiSpec::Claude => model
                .with_header("x-api-key", api_key)
                .with_header("anthropic-version", ANTHROPIC_VERSION),
            ApiSpec::Gemini | ApiSpec::Grok => model,
        }
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn provision(
        &self,
        config: &LmConfig,
        api_key: Option<&str>,
        progress: ProgressSink,
    ) -> Result<Arc<dyn LanguageModel>> {
        match config {
            LmConfig::Local { model_name } => {
                self.ollama.version().await?;
                self.ollama.ensure_model(model_name, &progress).await?;
                tracing::info!(model = %model_name, "Local model ready");
                Ok(Arc::new(ChatCompletionsModel::new(
                    self.client.clone(),
                    self.ollama.openai_base(),
                    model_name.clone(),
                )))
            }
            LmConfig::Api { spec, model_name } => {
                let api_key = api_key
                    .filter(|k| !k.trim().is_empty())
                    .ok_or(EngineError::MissingCredential(*spec))?;
                self.verify_credential(*spec, api_key).await?;
                tracing::info!(provider = %spec, model = %model_name, "API model ready");
                Ok(Arc::new(self.api_model(*spec, model_name, api_key)))
            }
        }
    }
}
