//! External tool servers over MCP's streamable HTTP transport.
//!
//! Registration runs `initialize`, sends `notifications/initialized` and
//! pages through `tools/list`. Servers may answer any request with plain JSON
//! or with a single-response SSE stream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::RwLock;
use parley_core::ToolDesc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::{ToolServer, ToolServerConnector};
use crate::error::{EngineError, Result};

/// Protocol revision sent during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "mcp-session-id";

/// Upper bound on `tools/list` pages fetched during registration.
const MAX_TOOL_PAGES: usize = 32;

/// Connects to MCP servers over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpToolServerConnector {
    client: reqwest::Client,
}

impl HttpToolServerConnector {
    /// Create a connector using `client`.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolServerConnector for HttpToolServerConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ToolServer>> {
        let server = McpServer::connect(self.client.clone(), url).await?;
        Ok(Arc::new(server))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDesc>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<Value>,
    structured_content: Option<Value>,
    #[serde(default)]
    is_error: bool,
}

impl CallToolResult {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A connected MCP server.
pub struct McpServer {
    client: reqwest::Client,
    url: String,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    tools: Vec<ToolDesc>,
}

impl McpServer {
    /// Perform the handshake with the server at `url` and discover its tools.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ToolServer` if any step fails.
    pub async fn connect(client: reqwest::Client, url: &str) -> Result<Self> {
        let mut server = Self {
            client,
            url: url.to_string(),
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            tools: Vec::new(),
        };

        let init = server
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "parley", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await?;
        tracing::debug!(
            url,
            server = init.pointer("/serverInfo/name").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "Tool server initialized"
        );
        server.notify("notifications/initialized").await?;

        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        for page_number in 1..=MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map_or_else(|| json!({}), |c| json!({ "cursor": c }));
            let page: ListToolsResult = serde_json::from_value(server.request("tools/list", params).await?)
                .map_err(|e| server.error(format!("invalid tools/list result: {e}")))?;
            server.tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        return Err(server.error(format!("tools/list repeated cursor {next}")));
                    }
                    if page_number == MAX_TOOL_PAGES {
                        return Err(server.error(format!("tools/list exceeded {MAX_TOOL_PAGES} pages")));
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        tracing::info!(url, tools = server.tools.len(), "Tool server registered");
        Ok(server)
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::ToolServer {
            url: self.url.clone(),
            message: message.into(),
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| self.error(e.to_string()))?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.error(format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.post(&json!({ "jsonrpc": "2.0", "method": method }))
            .await
            .map(drop)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .post(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let reply = if is_sse {
            self.read_sse_reply(response, id).await?
        } else {
            response
                .json::<RpcResponse>()
                .await
                .map_err(|e| self.error(format!("invalid response to {method}: {e}")))?
        };

        if let Some(error) = reply.error {
            return Err(self.error(format!("{method} failed ({}): {}", error.code, error.message)));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    async fn read_sse_reply(&self, response: reqwest::Response, id: u64) -> Result<RpcResponse> {
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| self.error(e.to_string()))?;
            let Ok(reply) = serde_json::from_str::<RpcResponse>(&event.data) else {
                continue;
            };
            if reply.id.as_ref().and_then(Value::as_u64) == Some(id) {
                return Ok(reply);
            }
        }
        Err(self.error(format!("stream closed before response {id}")))
    }
}

#[async_trait]
impl ToolServer for McpServer {
    fn url(&self) -> &str {
        &self.url
    }

    fn tools(&self) -> &[ToolDesc] {
        &self.tools
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| self.error(format!("invalid tools/call result: {e}")))?;

        if result.is_error {
            return Err(EngineError::ToolFailed {
                name: name.to_string(),
                message: result.text(),
            });
        }
        Ok(result
            .structured_content
            .clone()
            .unwrap_or_else(|| Value::String(result.text())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc(result: &Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
    }

    async fn mount_handshake(server: &MockServer) {
        mount_session(server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("tools/list"))
            .and(header("mcp-session-id", "session-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "result": { "tools": [
                        { "name": "add", "description": "Add numbers", "inputSchema": { "type": "object" } },
                        { "name": "fail" }
                    ] }
                })),
            )
            .mount(server)
            .await;
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_string_contains("\"method\":\"initialize\""))
            .respond_with(
                rpc(&json!({ "protocolVersion": PROTOCOL_VERSION, "serverInfo": { "name": "demo" } }))
                    .insert_header("Mcp-Session-Id", "session-1"),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("notifications/initialized"))
            .and(header("mcp-session-id", "session-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(server)
            .await;
    }

    /// Hands out a fresh cursor on every page.
    struct EndlessPages(AtomicU64);

    impl wiremock::Respond for EndlessPages {
        fn respond(&self, _: &wiremock::Request) -> ResponseTemplate {
            let page = self.0.fetch_add(1, Ordering::Relaxed);
            rpc(&json!({ "tools": [], "nextCursor": format!("page-{page}") }))
        }
    }

    #[tokio::test]
    async fn connect_discovers_tools() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;

        let connector = HttpToolServerConnector::new(reqwest::Client::new());
        let mcp = connector.connect(&server.uri()).await.unwrap();

        let names: Vec<_> = mcp.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["add", "fail"]);
        assert_eq!(mcp.tools()[0].parameters, json!({ "type": "object" }));
        assert_eq!(mcp.url(), server.uri());
    }

    #[tokio::test]
    async fn repeated_cursor_fails_registration() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("tools/list"))
            .respond_with(rpc(&json!({ "tools": [{ "name": "add" }], "nextCursor": "same" })))
            .expect(2)
            .mount(&server)
            .await;

        let connector = HttpToolServerConnector::new(reqwest::Client::new());
        match connector.connect(&server.uri()).await {
            Err(EngineError::ToolServer { message, .. }) => {
                assert_eq!(message, "tools/list repeated cursor same");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("registration should fail"),
        }
    }

    #[tokio::test]
    async fn endless_pagination_is_cut_off() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("tools/list"))
            .respond_with(EndlessPages(AtomicU64::new(0)))
            .expect(MAX_TOOL_PAGES as u64)
            .mount(&server)
            .await;

        let connector = HttpToolServerConnector::new(reqwest::Client::new());
        let Err(EngineError::ToolServer { message, .. }) = connector.connect(&server.uri()).await else {
            panic!("registration should fail");
        };
        assert_eq!(message, format!("tools/list exceeded {MAX_TOOL_PAGES} pages"));
    }

    #[tokio::test]
    async fn call_tool_reads_sse_reply() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"5\"}]}}\n\n";
        Mock::given(method("POST"))
            .and(body_string_contains("tools/call"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mcp = McpServer::connect(reqwest::Client::new(), &server.uri()).await.unwrap();
        let output = mcp.call_tool("add", json!({ "a": 2, "b": 3 })).await.unwrap();
        assert_eq!(output, json!("5"));
    }

    #[tokio::test]
    async fn tool_error_results_fail() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("tools/call"))
            .respond_with(rpc(&json!({
                "content": [{ "type": "text", "text": "boom" }],
                "isError": true
            })))
            .mount(&server)
            .await;

        let mcp = McpServer::connect(reqwest::Client::new(), &server.uri()).await.unwrap();
        let err = mcp.call_tool("fail", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolFailed { ref message, .. } if message == "boom"));
    }

    #[tokio::test]
    async fn unreachable_server_fails_registration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let connector = HttpToolServerConnector::new(reqwest::Client::new());
        let err = connector.connect(&server.uri()).await.err().unwrap();
        assert!(matches!(err, EngineError::ToolServer { ref url, .. } if *url == server.uri()));
    }
}
