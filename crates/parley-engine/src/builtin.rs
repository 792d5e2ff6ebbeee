//! Built-in tools: web search and web fetch.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::ToolDesc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::Tool;
use crate::error::{EngineError, Result};

/// Default DuckDuckGo HTML endpoint.
pub const DEFAULT_SEARCH_URL: &str = "https://html.duckduckgo.com/html";

/// Longest page text returned by `web_fetch`, in characters.
pub const MAX_FETCH_CHARS: usize = 20_000;

const WEB_SEARCH: &str = "web_search_duckduckgo";
const WEB_FETCH: &str = "web_fetch";

/// A built-in tool offered for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinToolInfo {
    /// Registration name.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
}

/// Every built-in tool.
pub const BUILTIN_TOOLS: [BuiltinToolInfo; 2] = [
    BuiltinToolInfo {
        id: WEB_SEARCH,
        name: "Web Search",
        description: "Search the web for information",
    },
    BuiltinToolInfo {
        id: WEB_FETCH,
        name: "Web Fetch",
        description: "Fetch a web page and return its text",
    },
];

/// Find a built-in tool by registration name.
#[must_use]
pub fn find_builtin(id: &str) -> Option<&'static BuiltinToolInfo> {
    BUILTIN_TOOLS.iter().find(|t| t.id == id)
}

/// Instantiate the built-in tool `name` with its JSON `config`.
///
/// # Errors
///
/// Returns `EngineError::UnknownTool` for names outside [`BUILTIN_TOOLS`] and
/// `EngineError::InvalidToolConfig` if `config` does not fit the tool.
pub fn create_builtin_tool(
    client: &reqwest::Client,
    name: &str,
    config: &Value,
) -> Result<Arc<dyn Tool>> {
    let config = if config.is_null() {
        json!({})
    } else {
        config.clone()
    };

    match name {
        WEB_SEARCH => {
            let config: WebSearchConfig = parse_config(name, config)?;
            Ok(Arc::new(WebSearchTool::new(client.clone(), config.base_url)?))
        }
        WEB_FETCH => {
            let config: WebFetchConfig = parse_config(name, config)?;
            Ok(Arc::new(WebFetchTool::new(client.clone(), config.proxy_url)?))
        }
        other => Err(EngineError::UnknownTool(other.to_string())),
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(name: &str, config: Value) -> Result<T> {
    serde_json::from_value(config).map_err(|e| EngineError::InvalidToolConfig {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::InvalidToolConfig {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn tool_failed(name: &str, message: impl Into<String>) -> EngineError {
    EngineError::ToolFailed {
        name: name.to_string(),
        message: message.into(),
    }
}

// =============================================================================
// Web search
// =============================================================================

#[derive(Debug, Deserialize)]
struct WebSearchConfig {
    #[serde(default = "WebSearchConfig::default_base_url")]
    base_url: String,
}

impl WebSearchConfig {
    fn default_base_url() -> String {
        DEFAULT_SEARCH_URL.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "SearchArgs::default_max_results")]
    max_results: usize,
}

impl SearchArgs {
    const fn default_max_results() -> usize {
        5
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    /// Page title.
    pub title: String,
    /// Target URL with the search engine's redirect removed.
    pub url: String,
    /// Result snippet.
    pub snippet: String,
}

/// Searches DuckDuckGo's HTML endpoint.
pub struct WebSearchTool {
    client: reqwest::Client,
    base_url: String,
    desc: ToolDesc,
    link_re: Regex,
    snippet_re: Regex,
    tag_re: Regex,
}

impl WebSearchTool {
    /// Create the tool, posting queries to `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the result patterns fail to compile.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client,
            base_url: base_url.into(),
            desc: ToolDesc::new(
                WEB_SEARCH,
                "Search the web. Returns a JSON array of results with title, url and snippet.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" },
                        "max_results": { "type": "integer", "default": 5, "description": "Maximum number of results" }
                    },
                    "required": ["query"]
                }),
            ),
            link_re: compile(
                WEB_SEARCH,
                r#"(?s)<a[^>]+class="result__a"[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#,
            )?,
            snippet_re: compile(
                WEB_SEARCH,
                r#"(?s)<a[^>]+class="result__snippet"[^>]*>(.*?)</a>"#,
            )?,
            tag_re: compile(WEB_SEARCH, r"<[^>]+>")?,
        })
    }

    /// Extract up to `max_results` hits from a result page.
    ///
    /// Each hit spans from its title link to the next one; its snippet is
    /// looked up inside that span only.
    #[must_use]
    pub fn parse_results(&self, html: &str, max_results: usize) -> Vec<SearchResult> {
        let links: Vec<_> = self.link_re.captures_iter(html).collect();

        links
            .iter()
            .enumerate()
            .take(max_results)
            .map(|(i, cap)| {
                let start = cap.get(0).map_or(0, |m| m.end());
                let end = links
                    .get(i + 1)
                    .and_then(|next| next.get(0))
                    .map_or(html.len(), |m| m.start());
                let snippet = self
                    .snippet_re
                    .captures(&html[start..end])
                    .and_then(|c| c.get(1))
                    .map(|m| self.clean(m.as_str()))
                    .unwrap_or_default();

                let href = cap.get(1).map_or("", |m| m.as_str());
                SearchResult {
                    title: self.clean(cap.get(2).map_or("", |m| m.as_str())),
                    url: unwrap_redirect(&html_escape::decode_html_entities(href)),
                    snippet,
                }
            })
            .collect()
    }

    fn clean(&self, fragment: &str) -> String {
        let text = self.tag_re.replace_all(fragment, "");
        html_escape::decode_html_entities(text.trim()).into_owned()
    }
}

/// DuckDuckGo wraps targets as `//duckduckgo.com/l/?uddg=<encoded>&...`.
fn unwrap_redirect(href: &str) -> String {
    href.split("uddg=")
        .nth(1)
        .and_then(|rest| rest.split('&').next())
        .and_then(|encoded| urlencoding::decode(encoded).ok())
        .map_or_else(|| href.to_string(), std::borrow::Cow::into_owned)
}

#[async_trait]
impl Tool for WebSearchTool {
    fn desc(&self) -> &ToolDesc {
        &self.desc
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let args: SearchArgs =
            serde_json::from_value(arguments).map_err(|e| tool_failed(WEB_SEARCH, e.to_string()))?;
        if args.query.trim().is_empty() {
            return Err(tool_failed(WEB_SEARCH, "query cannot be empty"));
        }

        tracing::debug!(query = %args.query, "Searching the web");
        let response = self
            .client
            .post(&self.base_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(format!("q={}", urlencoding::encode(&args.query)))
            .send()
            .await
            .map_err(|e| EngineError::network(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(tool_failed(WEB_SEARCH, format!("HTTP {status}")));
        }
        let html = response.text().await.map_err(|e| EngineError::network(&e))?;

        let results = self.parse_results(&html, args.max_results);
        serde_json::to_value(results).map_err(|e| tool_failed(WEB_SEARCH, e.to_string()))
    }
}

// =============================================================================
// Web fetch
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct WebFetchConfig {
    #[serde(default)]
    proxy_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
}

/// Fetches a page and reduces HTML to plain text.
pub struct WebFetchTool {
    client: reqwest::Client,
    proxy_url: Option<String>,
    desc: ToolDesc,
    hidden_re: Regex,
    break_re: Regex,
    tag_re: Regex,
    blank_re: Regex,
}

impl WebFetchTool {
    /// Create the tool. With `proxy_url` set, pages are fetched as
    /// `{proxy_url}?url=<target>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversion patterns fail to compile.
    pub fn new(client: reqwest::Client, proxy_url: Option<String>) -> Result<Self> {
        Ok(Self {
            client,
            proxy_url: proxy_url.filter(|p| !p.trim().is_empty()),
            desc: ToolDesc::new(
                WEB_FETCH,
                "Fetch a web page by URL and return its readable text.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "http or https URL" }
                    },
                    "required": ["url"]
                }),
            ),
            hidden_re: compile(
                WEB_FETCH,
                r"(?is)<script\b.*?</script>|<style\b.*?</style>|<!--.*?-->",
            )?,
            break_re: compile(
                WEB_FETCH,
                r"(?i)<br\s*/?>|</(p|div|h[1-6]|li|tr|section|article)>",
            )?,
            tag_re: compile(WEB_FETCH, r"<[^>]+>")?,
            blank_re: compile(WEB_FETCH, r"\n[ \t]*(\n[ \t]*)+")?,
        })
    }

    /// Reduce an HTML document to readable text.
    #[must_use]
    pub fn html_to_text(&self, html: &str) -> String {
        let text = self.hidden_re.replace_all(html, "");
        let text = self.break_re.replace_all(&text, "\n");
        let text = self.tag_re.replace_all(&text, "");
        let text = html_escape::decode_html_entities(&text);
        let text = self.blank_re.replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    fn request_url(&self, target: &str) -> String {
        match &self.proxy_url {
            Some(proxy) => format!("{proxy}?url={}", urlencoding::encode(target)),
            None => target.to_string(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn desc(&self) -> &ToolDesc {
        &self.desc
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let args: FetchArgs =
            serde_json::from_value(arguments).map_err(|e| tool_failed(WEB_FETCH, e.to_string()))?;
        let target = reqwest::Url::parse(&args.url)
            .map_err(|e| tool_failed(WEB_FETCH, format!("invalid URL: {e}")))?;
        if target.scheme() != "http" && target.scheme() != "https" {
            return Err(tool_failed(WEB_FETCH, "only http and https URLs are supported"));
        }

        tracing::debug!(url = %target, proxied = self.proxy_url.is_some(), "Fetching page");
        let response = self
            .client
            .get(self.request_url(target.as_str()))
            .send()
            .await
            .map_err(|e| EngineError::network(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(tool_failed(WEB_FETCH, format!("HTTP {status}")));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));
        let body = response.text().await.map_err(|e| EngineError::network(&e))?;

        let text = if is_html || body.trim_start().starts_with('<') {
            self.html_to_text(&body)
        } else {
            body
        };
        Ok(Value::String(text.chars().take(MAX_FETCH_CHARS).collect()))
    }
}
