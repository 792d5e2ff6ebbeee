//! Streaming chat completions over the OpenAI-compatible HTTP protocol.
//!
//! One run may span several requests: when the model finishes with tool
//! calls, the tools are invoked, their results are emitted as `tool`
//! messages and the conversation is sent again.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parley_core::{
    AccumulatedState, FinishReason, Message, MessageDelta, MessageDeltaOutput, Part, PartDelta,
    Role, RunConfig, ThinkEffort,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::backend::{DeltaStream, LanguageModel, Tool};
use crate::error::{EngineError, Result};

/// Upper bound on model requests within one run.
pub const MAX_TOOL_ROUNDS: usize = 8;

type DeltaSender = mpsc::Sender<Result<MessageDeltaOutput>>;

/// A model served behind a `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatCompletionsModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    headers: Vec<(&'static str, String)>,
    max_tokens_field: &'static str,
}

impl ChatCompletionsModel {
    /// Create a model bound to `base_url` (without the `/chat/completions`
    /// suffix).
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            headers: Vec::new(),
            max_tokens_field: "max_tokens",
        }
    }

    /// Authenticate with a bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Send an extra header on every request.
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Name the request field that carries the token limit.
    #[must_use]
    pub const fn with_max_tokens_field(mut self, field: &'static str) -> Self {
        self.max_tokens_field = field;
        self
    }

    /// Build the JSON request body.
    #[must_use]
    pub fn request_body(
        &self,
        messages: &[Message],
        tools: &[Arc<dyn Tool>],
        config: &RunConfig,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": messages.iter().map(request_message).collect::<Vec<_>>(),
        });

        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|tool| {
                    let desc = tool.desc();
                    json!({
                        "type": "function",
                        "function": {
                            "name": desc.name,
                            "description": desc.description.clone().unwrap_or_default(),
                            "parameters": desc.parameters,
                        }
                    })
                })
                .collect();
        }

        if let Some(inference) = &config.inference {
            let effort = match inference.think_effort {
                Some(ThinkEffort::Enable | ThinkEffort::Medium) => Some("medium"),
                Some(ThinkEffort::Low) => Some("low"),
                Some(ThinkEffort::High) => Some("high"),
                Some(ThinkEffort::Disable) | None => None,
            };
            if let Some(effort) = effort {
                body["reasoning_effort"] = json!(effort);
            }
            if let Some(temperature) = inference.temperature {
                body["temperature"] = json!(temperature);
            }
            if let Some(top_p) = inference.top_p {
                body["top_p"] = json!(top_p);
            }
            if let Some(max_tokens) = inference.max_tokens {
                body[self.max_tokens_field] = json!(max_tokens);
            }
        }

        body
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[Arc<dyn Tool>],
        config: &RunConfig,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self
            .client
            .post(url)
            .json(&self.request_body(messages, tools, config));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|e| EngineError::network(&e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// Stream one assistant message. Returns `None` if the receiver is gone.
    async fn complete(
        &self,
        history: &[Message],
        tools: &[Arc<dyn Tool>],
        config: &RunConfig,
        tx: &DeltaSender,
    ) -> Result<Option<Message>> {
        let response = self.send(history, tools, config).await?;
        let mut events = response.bytes_stream().eventsource();

        let mut state = AccumulatedState::new();
        let mut call_ids = HashMap::new();
        let mut finished = false;

        'events: while let Some(event) = events.next().await {
            let event = event.map_err(|e| EngineError::Stream(e.to_string()))?;
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            let chunk: ChatChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(error = %e, data, "Skipping undecodable chunk");
                    continue;
                }
            };

            for choice in chunk.choices {
                let delta = convert_delta(choice.delta, &mut call_ids);
                let reason = choice
                    .finish_reason
                    .as_deref()
                    .filter(|r| !r.is_empty())
                    .map(finish_reason);
                if !has_payload(&delta) && reason.is_none() {
                    continue;
                }

                state.apply(delta.clone())?;
                let terminal = reason.is_some();
                let output = MessageDeltaOutput {
                    delta,
                    finish_reason: reason,
                };
                if tx.send(Ok(output)).await.is_err() {
                    return Ok(None);
                }
                if terminal {
                    finished = true;
                    break 'events;
                }
            }
        }

        if !finished {
            tracing::debug!(model = %self.model, "Stream ended without finish_reason");
            let delta = MessageDelta {
                role: Some(Role::Assistant),
                ..MessageDelta::default()
            };
            state.apply(delta.clone())?;
            let output = MessageDeltaOutput::finished(delta, FinishReason::Stop);
            if tx.send(Ok(output)).await.is_err() {
                return Ok(None);
            }
        }

        Ok(Some(state.finalize()?))
    }

    async fn drive(
        self,
        mut history: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
        config: RunConfig,
        tx: &DeltaSender,
    ) -> Result<()> {
        for _ in 0..MAX_TOOL_ROUNDS {
            let Some(assistant) = self.complete(&history, &tools, &config, tx).await? else {
                return Ok(());
            };
            let calls = assistant.tool_calls.clone();
            history.push(assistant);
            if calls.is_empty() {
                return Ok(());
            }

            for call in calls {
                let Part::Function {
                    id,
                    name,
                    arguments,
                } = call
                else {
                    continue;
                };
                let output = invoke_tool(&tools, &name, &arguments).await;
                let result = Message::tool_result(id, vec![Part::text(output)]);
                let delta = MessageDelta::from(result.clone());
                if tx
                    .send(Ok(MessageDeltaOutput::finished(delta, FinishReason::Stop)))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                history.push(result);
            }
        }

        Err(EngineError::Stream(format!(
            "stopped after {MAX_TOOL_ROUNDS} tool rounds"
        )))
    }
}

impl LanguageModel for ChatCompletionsModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn run(
        &self,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
        config: RunConfig,
    ) -> DeltaStream {
        let (tx, stream) = DeltaStream::channel();
        let model = self.clone();
        tokio::spawn(async move {
            if let Err(e) = model.drive(messages, tools, config, &tx).await {
                tracing::warn!(error = %e, "Run failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        stream
    }
}

async fn invoke_tool(tools: &[Arc<dyn Tool>], name: &str, arguments: &str) -> String {
    let Some(tool) = tools.iter().find(|t| t.desc().name == name) else {
        return format!("error: unknown tool {name}");
    };

    let arguments = if arguments.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str(arguments) {
            Ok(value) => value,
            Err(e) => return format!("error: invalid arguments: {e}"),
        }
    };

    tracing::debug!(tool = name, "Invoking tool");
    match tool.call(arguments).await {
        Ok(Value::String(text)) => text,
        Ok(value) => value.to_string(),
        Err(e) => {
            tracing::warn!(tool = name, error = %e, "Tool call failed");
            format!("error: {e}")
        }
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: u64,
    id: Option<String>,
    #[serde(default)]
    function: ChunkFunction,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn convert_delta(delta: ChunkDelta, call_ids: &mut HashMap<u64, String>) -> MessageDelta {
    let mut out = MessageDelta {
        role: Some(Role::Assistant),
        thinking: delta
            .reasoning_content
            .or(delta.reasoning)
            .filter(|t| !t.is_empty()),
        ..MessageDelta::default()
    };

    if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
        out.contents.push(PartDelta::text(text));
    }

    // Continuation fragments omit the id; key them by index instead.
    for call in delta.tool_calls.unwrap_or_default() {
        let id = match call.id {
            Some(id) => {
                call_ids.insert(call.index, id.clone());
                id
            }
            None => call_ids
                .entry(call.index)
                .or_insert_with(|| format!("call_{}", call.index))
                .clone(),
        };
        out.tool_calls.push(PartDelta::Function {
            id: Some(id),
            name: call.function.name,
            arguments: call.function.arguments.unwrap_or_default(),
        });
    }

    out
}

fn has_payload(delta: &MessageDelta) -> bool {
    delta.thinking.is_some() || !delta.contents.is_empty() || !delta.tool_calls.is_empty()
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCall,
        "content_filter" | "refusal" => FinishReason::Refusal {
            reason: reason.to_string(),
        },
        _ => FinishReason::Stop,
    }
}

fn request_message(message: &Message) -> Value {
    if message.role == Role::Tool {
        return json!({
            "role": "tool",
            "tool_call_id": message.id.clone().unwrap_or_default(),
            "content": message.text(),
        });
    }

    let mut value = json!({
        "role": message.role.as_str(),
        "content": request_content(&message.contents),
    });

    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .filter_map(|part| match part {
                Part::Function {
                    id,
                    name,
                    arguments,
                } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                })),
                _ => None,
            })
            .collect();
    }

    value
}

fn request_content(parts: &[Part]) -> Value {
    if parts.is_empty() {
        return Value::Null;
    }

    let has_image = parts.iter().any(|p| matches!(p, Part::Image { .. }));
    if !has_image {
        return Value::String(parts.iter().filter_map(part_text).collect());
    }

    parts
        .iter()
        .filter_map(|part| match part {
            Part::Image { data } => Some(json!({
                "type": "image_url",
                "image_url": { "url": data_url(data) },
            })),
            other => part_text(other).map(|text| json!({ "type": "text", "text": text })),
        })
        .collect()
}

fn part_text(part: &Part) -> Option<String> {
    match part {
        Part::Text { text } => Some(text.clone()),
        Part::Value { value } => Some(value.to_string()),
        Part::Image { .. } | Part::Function { .. } => None,
    }
}

fn data_url(data: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        image_mime(data),
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

/// Sniff an image MIME type from its magic bytes.
#[must_use]
pub fn image_mime(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Tool;
    use async_trait::async_trait;
    use parley_core::{finalize, accumulate, InferenceConfig, ToolDesc};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct UpperTool {
        desc: ToolDesc,
    }

    impl UpperTool {
        fn new() -> Self {
            Self {
                desc: ToolDesc::new("upper", "Uppercase text", json!({ "type": "object" })),
            }
        }
    }

    #[async_trait]
    impl Tool for UpperTool {
        fn desc(&self) -> &ToolDesc {
            &self.desc
        }

        async fn call(&self, arguments: Value) -> Result<Value> {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(Value::String(text.to_uppercase()))
        }
    }

    fn sse(chunks: &[Value]) -> ResponseTemplate {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    fn text_chunk(text: &str, finish: Option<&str>) -> Value {
        json!({ "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": finish }] })
    }

    async fn collect(stream: DeltaStream) -> Vec<MessageDeltaOutput> {
        stream.map(|item| item.unwrap()).collect().await
    }

    fn messages_of(outputs: Vec<MessageDeltaOutput>) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut state = None;
        for output in outputs {
            let terminal = output.is_terminal();
            state = Some(accumulate(state, output.delta).unwrap());
            if terminal {
                messages.push(finalize(&state.take().unwrap()).unwrap());
            }
        }
        messages
    }

    #[tokio::test]
    async fn streams_text_deltas() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(sse(&[
                json!({ "choices": [{ "delta": { "role": "assistant", "content": "" } }] }),
                text_chunk("H", None),
                text_chunk("i there", None),
                text_chunk("", Some("stop")),
            ]))
            .mount(&server)
            .await;

        let model = ChatCompletionsModel::new(reqwest::Client::new(), format!("{}/v1", server.uri()), "gpt-test")
            .with_api_key("sk-test");
        let outputs = collect(model.run(vec![Message::user("Hello")], Vec::new(), RunConfig::default())).await;

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[2].finish_reason, Some(FinishReason::Stop));
        assert_eq!(messages_of(outputs), vec![Message::assistant("Hi there")]);
    }

    #[tokio::test]
    async fn runs_tool_calls_and_continues() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("tool_call_id"))
            .respond_with(sse(&[text_chunk("The answer is HELLO", Some("stop"))]))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(sse(&[
                json!({ "choices": [{ "delta": { "tool_calls": [
                    { "index": 0, "id": "call_9", "function": { "name": "upper", "arguments": "{\"te" } }
                ] } }] }),
                json!({ "choices": [{ "delta": { "tool_calls": [
                    { "index": 0, "function": { "arguments": "xt\":\"hello\"}" } }
                ] } }] }),
                json!({ "choices": [{ "delta": {}, "finish_reason": "tool_calls" }] }),
            ]))
            .with_priority(2)
            .mount(&server)
            .await;

        let model = ChatCompletionsModel::new(reqwest::Client::new(), server.uri(), "m");
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(UpperTool::new())];
        let outputs = collect(model.run(vec![Message::user("shout hello")], tools, RunConfig::default())).await;
        let messages = messages_of(outputs);

        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0].tool_calls,
            vec![Part::Function {
                id: Some("call_9".into()),
                name: "upper".into(),
                arguments: "{\"text\":\"hello\"}".into(),
            }]
        );
        assert_eq!(messages[1].role, Role::Tool);
        assert_eq!(messages[1].id.as_deref(), Some("call_9"));
        assert_eq!(messages[1].text(), "HELLO");
        assert_eq!(messages[2], Message::assistant("The answer is HELLO"));
    }

    #[tokio::test]
    async fn api_errors_end_the_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let model = ChatCompletionsModel::new(reqwest::Client::new(), server.uri(), "m");
        let items: Vec<_> = model
            .run(vec![Message::user("hi")], Vec::new(), RunConfig::default())
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(EngineError::Api { status: 401, ref message }) if message == "bad key"
        ));
    }

    #[tokio::test]
    async fn missing_finish_reason_is_synthesized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[text_chunk("partial", None)]))
            .mount(&server)
            .await;

        let model = ChatCompletionsModel::new(reqwest::Client::new(), server.uri(), "m");
        let outputs = collect(model.run(vec![Message::user("hi")], Vec::new(), RunConfig::default())).await;

        assert!(outputs.last().unwrap().is_terminal());
        assert_eq!(messages_of(outputs), vec![Message::assistant("partial")]);
    }

    #[test]
    fn request_body_carries_options_tools_and_images() {
        let model = ChatCompletionsModel::new(reqwest::Client::new(), "http://x", "gpt-test")
            .with_max_tokens_field("max_completion_tokens");
        let config = RunConfig {
            inference: Some(InferenceConfig {
                think_effort: Some(ThinkEffort::Enable),
                max_tokens: Some(256),
                ..InferenceConfig::default()
            }),
        };
        let messages = vec![
            Message::system("be brief"),
            Message::new(Role::User, vec![Part::text("what?"), Part::image(vec![0xFF, 0xD8, 0xFF, 0])]),
        ];
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(UpperTool::new())];

        let body = model.request_body(&messages, &tools, &config);

        assert_eq!(body["reasoning_effort"], "medium");
        assert_eq!(body["max_completion_tokens"], 256);
        assert_eq!(body["messages"][0], json!({ "role": "system", "content": "be brief" }));
        assert_eq!(body["messages"][1]["content"][0], json!({ "type": "text", "text": "what?" }));
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,/9j/AA=="
        );
        assert_eq!(body["tools"][0]["function"]["name"], "upper");
    }

    #[test]
    fn disabled_thinking_omits_effort() {
        let model = ChatCompletionsModel::new(reqwest::Client::new(), "http://x", "m");
        let mut config = RunConfig::default();
        config.set_think_effort(ThinkEffort::Disable);
        let body = model.request_body(&[Message::user("hi")], &[], &config);
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("tools").is_none());
    }
}
