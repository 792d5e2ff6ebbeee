//! Runtime configuration types.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parley_engine::{
    builtin::DEFAULT_SEARCH_URL, HttpModelBackend, HttpToolServerConnector, OllamaClient,
    ProviderEndpoints, DEFAULT_OLLAMA_HOST,
};
use parley_worker::WorkerDeps;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, RuntimeError};

/// Configuration for the chat runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding the database.
    #[serde(default = "RuntimeConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the local model server.
    #[serde(default = "RuntimeConfig::default_ollama_host")]
    pub ollama_host: String,

    /// Endpoint the web search tool posts queries to.
    #[serde(default = "RuntimeConfig::default_search_url")]
    pub search_url: String,

    /// Proxy the web fetch tool routes pages through.
    #[serde(default)]
    pub fetch_proxy: Option<String>,

    /// Hosted provider endpoints.
    #[serde(default)]
    pub endpoints: ProviderEndpoints,

    /// HTTP connect timeout in seconds.
    #[serde(default = "RuntimeConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl RuntimeConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from(".parley")
    }

    fn default_ollama_host() -> String {
        DEFAULT_OLLAMA_HOST.to_string()
    }

    fn default_search_url() -> String {
        DEFAULT_SEARCH_URL.to_string()
    }

    const fn default_connect_timeout() -> u64 {
        10
    }

    /// Get the connect timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Path of the `RocksDB` database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("db")
    }

    /// Build the shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Transport` if the TLS backend cannot start.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::Transport(e.to_string()))
    }

    /// Client for the local model server.
    #[must_use]
    pub fn ollama(&self, http: &reqwest::Client) -> OllamaClient {
        OllamaClient::new(http.clone(), self.ollama_host.clone())
    }

    /// Capabilities for a worker talking to real providers and servers.
    #[must_use]
    pub fn worker_deps(&self, http: &reqwest::Client) -> WorkerDeps {
        WorkerDeps {
            backend: Arc::new(HttpModelBackend::new(
                http.clone(),
                self.ollama(http),
                self.endpoints.clone(),
            )),
            connector: Arc::new(HttpToolServerConnector::new(http.clone())),
            http: http.clone(),
        }
    }

    /// Configuration sent with `add-builtin-tool` for the tool `id`.
    #[must_use]
    pub fn builtin_tool_config(&self, id: &str) -> Value {
        match id {
            "web_search_duckduckgo" => json!({ "base_url": self.search_url }),
            "web_fetch" => match &self.fetch_proxy {
                Some(proxy) => json!({ "proxy_url": proxy }),
                None => json!({}),
            },
            _ => json!({}),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            ollama_host: Self::default_ollama_host(),
            search_url: Self::default_search_url(),
            fetch_proxy: None,
            endpoints: ProviderEndpoints::default(),
            connect_timeout_seconds: Self::default_connect_timeout(),
        }
    }
}
