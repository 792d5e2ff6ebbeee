//! Client for the local model server (Ollama HTTP API).
//!
//! Local models are pulled on first use; the server then exposes them through
//! its OpenAI-compatible `/v1` endpoint, which [`ChatCompletionsModel`] talks
//! to like any hosted provider.
//!
//! [`ChatCompletionsModel`]: crate::chat::ChatCompletionsModel

use std::collections::HashMap;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::backend::ProgressSink;
use crate::error::{EngineError, Result};

/// Default address of the local model server.
pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";

/// HTTP client for a local model server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    host: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    digest: Option<String>,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

impl OllamaClient {
    /// Create a client for the server at `host`.
    #[must_use]
    pub fn new(client: reqwest::Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    /// Server base URL.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Base URL of the server's OpenAI-compatible API.
    #[must_use]
    pub fn openai_base(&self) -> String {
        format!("{}/v1", self.host)
    }

    fn unavailable(err: &reqwest::Error) -> EngineError {
        EngineError::LocalUnavailable(err.to_string())
    }

    /// Check that the server is reachable and return its version.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LocalUnavailable` if the server cannot be reached.
    pub async fn version(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/api/version", self.host))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Self::unavailable(&e))?;
        let version: VersionResponse = response.json().await.map_err(|e| Self::unavailable(&e))?;
        Ok(version.version)
    }

    /// List the models already present on the server.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LocalUnavailable` if the server cannot be reached.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Self::unavailable(&e))?;
        let tags: TagsResponse = response.json().await.map_err(|e| Self::unavailable(&e))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Check whether `name` is present on the server.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LocalUnavailable` if the server cannot be reached.
    pub async fn has_model(&self, name: &str) -> Result<bool> {
        let latest = format!("{name}:latest");
        Ok(self
            .list_models()
            .await?
            .iter()
            .any(|m| m == name || *m == latest))
    }

    /// Download `name`, reporting byte progress summed over all layers.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ModelDownload` if the server reports a failure
    /// or the stream ends before success.
    pub async fn pull(&self, name: &str, progress: &ProgressSink) -> Result<()> {
        tracing::info!(model = name, "Pulling model");

        let response = self
            .client
            .post(format!("{}/api/pull", self.host))
            .json(&json!({ "model": name, "stream": true }))
            .send()
            .await
            .map_err(|e| Self::unavailable(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ModelDownload(format!("{status}: {body}")));
        }

        let mut layers: HashMap<String, (u64, u64)> = HashMap::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut succeeded = false;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| EngineError::ModelDownload(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                succeeded |= Self::handle_pull_line(&line, &mut layers, progress)?;
            }
        }
        if !buffer.is_empty() {
            succeeded |= Self::handle_pull_line(&buffer, &mut layers, progress)?;
        }

        if succeeded {
            tracing::info!(model = name, "Model pulled");
            Ok(())
        } else {
            Err(EngineError::ModelDownload(format!(
                "pull of {name} ended without success"
            )))
        }
    }

    /// Apply one NDJSON line; returns true on the final success status.
    fn handle_pull_line(
        line: &[u8],
        layers: &mut HashMap<String, (u64, u64)>,
        progress: &ProgressSink,
    ) -> Result<bool> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(false);
        }

        let status: PullStatus = match serde_json::from_str(line) {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(error = %e, line, "Skipping undecodable pull status");
                return Ok(false);
            }
        };
        if let Some(error) = status.error {
            return Err(EngineError::ModelDownload(error));
        }

        if let (Some(digest), Some(total)) = (status.digest, status.total) {
            layers.insert(digest, (status.completed.unwrap_or(0), total));
            let (current, total) = layers
                .values()
                .fold((0, 0), |(c, t), (lc, lt)| (c + lc, t + lt));
            progress.report(current, total);
        }

        Ok(status.status == "success")
    }

    /// Remove `name` from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or refuses the deletion.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/delete", self.host))
            .json(&json!({ "model": name }))
            .send()
            .await
            .map_err(|e| Self::unavailable(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        tracing::info!(model = name, "Model deleted");
        Ok(())
    }

    /// Make `name` available, pulling it if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or the pull fails.
    pub async fn ensure_model(&self, name: &str, progress: &ProgressSink) -> Result<()> {
        if self.has_model(name).await? {
            tracing::debug!(model = name, "Model already present");
            return Ok(());
        }
        self.pull(name, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheProgress;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OllamaClient {
        OllamaClient::new(reqwest::Client::new(), server.uri())
    }

    #[tokio::test]
    async fn version_is_read_from_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "version": "0.9.1" })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).version().await.unwrap(), "0.9.1");
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let ollama = OllamaClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        assert!(matches!(
            ollama.version().await,
            Err(EngineError::LocalUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn has_model_matches_latest_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "qwen3:4b" }, { "name": "llava:latest" }]
            })))
            .mount(&server)
            .await;

        let ollama = client(&server);
        assert!(ollama.has_model("qwen3:4b").await.unwrap());
        assert!(ollama.has_model("llava").await.unwrap());
        assert!(!ollama.has_model("qwen3:8b").await.unwrap());
    }

    #[tokio::test]
    async fn pull_sums_layer_progress() {
        let server = MockServer::start().await;
        let body = [
            json!({ "status": "pulling manifest" }),
            json!({ "status": "pulling a", "digest": "sha256:a", "total": 100, "completed": 40 }),
            json!({ "status": "pulling b", "digest": "sha256:b", "total": 50, "completed": 50 }),
            json!({ "status": "pulling a", "digest": "sha256:a", "total": 100, "completed": 100 }),
            json!({ "status": "success" }),
        ]
        .iter()
        .map(|v| format!("{v}\n"))
        .collect::<String>();
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (sink, mut rx) = ProgressSink::channel();
        client(&server).pull("qwen3:4b", &sink).await.unwrap();
        drop(sink);

        let mut reports = Vec::new();
        while let Some(report) = rx.recv().await {
            reports.push(report);
        }
        assert_eq!(
            reports,
            vec![
                CacheProgress { current: 40, total: 100 },
                CacheProgress { current: 90, total: 150 },
                CacheProgress { current: 150, total: 150 },
            ]
        );
    }

    #[tokio::test]
    async fn pull_error_line_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"status\":\"pulling manifest\"}\n{\"error\":\"file does not exist\"}\n"),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .pull("nope", &ProgressSink::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelDownload(ref m) if m == "file does not exist"));
    }

    #[tokio::test]
    async fn ensure_model_skips_present_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [{ "name": "qwen3:4b" }] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        client(&server)
            .ensure_model("qwen3:4b", &ProgressSink::noop())
            .await
            .unwrap();
    }
}
