//! Typed access to persisted settings.
//!
//! Settings are JSON values under fixed names. Reads never fail: an absent
//! or undecodable value yields the caller's default.

use std::collections::HashMap;

use parley_core::ToolDesc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::types::ExternalServerRecord;
use crate::Store;

/// Setting names.
pub mod key {
    /// Local models whose weights have been downloaded (`Vec<String>`).
    pub const DOWNLOADED_MODELS: &str = "downloadedModels";
    /// The selected model binding (`Option<LmConfig>`).
    pub const SELECTED_MODEL: &str = "selectedModel";
    /// API credentials per provider (`ApiKeys`).
    pub const API_KEYS: &str = "apiKeys";
    /// Selected built-in tool ids, in selection order (`Vec<String>`).
    pub const SELECTED_BUILTIN_TOOLS: &str = "selectedBuiltinTools";
    /// Registered external tool servers (`Vec<ExternalServerRecord>`).
    pub const EXTERNAL_SERVERS: &str = "externalServers";
    /// Run options (`RunConfig`).
    pub const AGENT_RUN_CONFIG: &str = "agentRunConfig";
    /// System prompt (`String`).
    pub const SYSTEM_PROMPT: &str = "systemPrompt";
}

/// Setting names written by earlier releases.
pub mod legacy {
    /// Server list, `[{ url }]`.
    pub const MCP_SERVERS: &str = "mcpServers";
    /// Server list under the older "client" naming, `[{ url }]`.
    pub const MCP_CLIENTS: &str = "mcpClients";
    /// Discovered tools per server URL.
    pub const MCP_TOOLS: &str = "mcpTools";
    /// Selected tool names per server URL.
    pub const SELECTED_MCP_TOOLS: &str = "selectedMCPTools";
}

/// JSON-typed helpers over any [`Store`].
pub trait SettingsExt: Store {
    /// Load a setting, falling back to `default` when absent or undecodable.
    fn load<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get_setting(key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(key, error = %e, "Ignoring undecodable setting");
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read setting");
                default
            }
        }
    }

    /// Persist a setting.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded or written.
    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put_setting(key, &bytes)
    }
}

impl<S: Store + ?Sized> SettingsExt for S {}

#[derive(Deserialize)]
struct LegacyServer {
    url: String,
}

/// A selected built-in tool, either a bare id or the older
/// `{ id, name, description, icon }` record.
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyBuiltinTool {
    Id(String),
    Record { id: String },
}

impl LegacyBuiltinTool {
    fn is_record(&self) -> bool {
        matches!(self, Self::Record { .. })
    }

    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Record { id } => id,
        }
    }
}

/// Fold legacy settings into their current shapes.
///
/// Selected built-in tools stored as records are rewritten as ids. Legacy
/// external-server settings are folded into [`key::EXTERNAL_SERVERS`]
/// once: if the canonical key already exists the legacy keys are only
/// deleted. Servers appearing under both legacy list names are merged by
/// URL in first-seen order. Returns true if anything was migrated.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn migrate_legacy_settings<S: Store + ?Sized>(store: &S) -> Result<bool> {
    let builtins = migrate_builtin_selection(store)?;
    Ok(migrate_servers(store)? || builtins)
}

/// Rewrite record-shaped entries of [`key::SELECTED_BUILTIN_TOOLS`] as ids.
fn migrate_builtin_selection<S: Store + ?Sized>(store: &S) -> Result<bool> {
    let Some(bytes) = store.get_setting(key::SELECTED_BUILTIN_TOOLS)? else {
        return Ok(false);
    };
    let Ok(entries) = serde_json::from_slice::<Vec<LegacyBuiltinTool>>(&bytes) else {
        return Ok(false);
    };
    if !entries.iter().any(LegacyBuiltinTool::is_record) {
        return Ok(false);
    }

    let mut ids: Vec<String> = Vec::with_capacity(entries.len());
    for id in entries.into_iter().map(LegacyBuiltinTool::into_id) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    store.save(key::SELECTED_BUILTIN_TOOLS, &ids)?;
    tracing::info!(tools = ?ids, "Migrated legacy built-in tool selection");
    Ok(true)
}

fn migrate_servers<S: Store + ?Sized>(store: &S) -> Result<bool> {
    let legacy_keys = [
        legacy::MCP_SERVERS,
        legacy::MCP_CLIENTS,
        legacy::MCP_TOOLS,
        legacy::SELECTED_MCP_TOOLS,
    ];

    let mut present = false;
    for name in legacy_keys {
        present |= store.get_setting(name)?.is_some();
    }
    if !present {
        return Ok(false);
    }

    let migrated = if store.get_setting(key::EXTERNAL_SERVERS)?.is_some() {
        false
    } else {
        let mut servers: Vec<ExternalServerRecord> = Vec::new();
        for list in [legacy::MCP_SERVERS, legacy::MCP_CLIENTS] {
            for server in store.load::<Vec<LegacyServer>>(list, Vec::new()) {
                if !servers.iter().any(|s| s.url == server.url) {
                    servers.push(ExternalServerRecord::new(server.url));
                }
            }
        }

        let mut tools: HashMap<String, Vec<ToolDesc>> =
            store.load(legacy::MCP_TOOLS, HashMap::new());
        let mut selected: HashMap<String, Vec<String>> =
            store.load(legacy::SELECTED_MCP_TOOLS, HashMap::new());
        for server in &mut servers {
            server.tools = tools.remove(&server.url).unwrap_or_default();
            server.selected = selected.remove(&server.url).unwrap_or_default();
        }

        store.save(key::EXTERNAL_SERVERS, &servers)?;
        tracing::info!(servers = servers.len(), "Migrated legacy external server settings");
        true
    };

    for name in legacy_keys {
        store.delete_setting(name)?;
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RocksStore;
    use parley_core::{ApiKeys, ApiSpec};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn load_falls_back_to_default() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.load(key::SYSTEM_PROMPT, "default".to_string()), "default");

        store.put_setting(key::DOWNLOADED_MODELS, b"{not json").unwrap();
        let models: Vec<String> = store.load(key::DOWNLOADED_MODELS, Vec::new());
        assert!(models.is_empty());
    }

    #[test]
    fn save_then_load() {
        let (store, _dir) = create_test_store();
        let mut keys = ApiKeys::default();
        keys.set(ApiSpec::OpenAI, Some("sk-test".into()));

        store.save(key::API_KEYS, &keys).unwrap();
        let loaded: ApiKeys = store.load(key::API_KEYS, ApiKeys::default());
        assert_eq!(loaded.get(ApiSpec::OpenAI), Some("sk-test"));
    }

    #[test]
    fn migrates_legacy_server_shapes() {
        let (store, _dir) = create_test_store();
        store
            .put_setting(
                legacy::MCP_SERVERS,
                br#"[{"url":"http://a/mcp"},{"url":"http://b/mcp"}]"#,
            )
            .unwrap();
        store
            .put_setting(legacy::MCP_CLIENTS, br#"[{"url":"http://b/mcp"},{"url":"http://c/mcp"}]"#)
            .unwrap();
        store
            .put_setting(
                legacy::MCP_TOOLS,
                br#"{"http://a/mcp":[{"name":"add","description":"Add","inputSchema":{"type":"object"}}]}"#,
            )
            .unwrap();
        store
            .put_setting(legacy::SELECTED_MCP_TOOLS, br#"{"http://a/mcp":["add"]}"#)
            .unwrap();

        assert!(migrate_legacy_settings(&store).unwrap());

        let servers: Vec<ExternalServerRecord> = store.load(key::EXTERNAL_SERVERS, Vec::new());
        let urls: Vec<_> = servers.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["http://a/mcp", "http://b/mcp", "http://c/mcp"]);
        assert_eq!(servers[0].tools[0].name, "add");
        assert!(servers[0].is_selected("add"));
        assert!(servers[1].tools.is_empty());

        for name in [legacy::MCP_SERVERS, legacy::MCP_CLIENTS, legacy::MCP_TOOLS] {
            assert_eq!(store.get_setting(name).unwrap(), None);
        }

        // Idempotent.
        assert!(!migrate_legacy_settings(&store).unwrap());
    }

    #[test]
    fn migrates_builtin_tool_records_to_ids() {
        let (store, _dir) = create_test_store();
        store
            .put_setting(
                key::SELECTED_BUILTIN_TOOLS,
                br#"[{"id":"web_search_duckduckgo","name":"Web Search","description":"Search","icon":"search"},{"id":"web_fetch","name":"Web Fetch","description":"Fetch","icon":"globe"}]"#,
            )
            .unwrap();

        assert!(migrate_legacy_settings(&store).unwrap());
        let selected: Vec<String> = store.load(key::SELECTED_BUILTIN_TOOLS, Vec::new());
        assert_eq!(selected, vec!["web_search_duckduckgo", "web_fetch"]);

        // Already-migrated selections are left alone.
        assert!(!migrate_legacy_settings(&store).unwrap());
        let selected: Vec<String> = store.load(key::SELECTED_BUILTIN_TOOLS, Vec::new());
        assert_eq!(selected, vec!["web_search_duckduckgo", "web_fetch"]);
    }

    #[test]
    fn canonical_settings_win_over_legacy() {
        let (store, _dir) = create_test_store();
        store
            .save(key::EXTERNAL_SERVERS, &vec![ExternalServerRecord::new("http://new/mcp")])
            .unwrap();
        store
            .put_setting(legacy::MCP_SERVERS, br#"[{"url":"http://old/mcp"}]"#)
            .unwrap();

        assert!(!migrate_legacy_settings(&store).unwrap());
        let servers: Vec<ExternalServerRecord> = store.load(key::EXTERNAL_SERVERS, Vec::new());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].url, "http://new/mcp");
        assert_eq!(store.get_setting(legacy::MCP_SERVERS).unwrap(), None);
    }
}
