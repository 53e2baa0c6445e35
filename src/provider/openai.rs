//! OpenAI-compatible chat client over `reqwest`.
//!
//! Speaks `POST {endpoint}/chat/completions` (batch and SSE streaming) and
//! uses `GET {endpoint}/models` as the health probe. HTTP failures map onto
//! [`ProviderError`]:
//!
//! | Response | Error |
//! |----------|-------|
//! | 429, 503 | `Overloaded` |
//! | other 5xx, connection failure | `Unavailable` |
//! | other 4xx | `InvalidRequest` |
//! | client timeout | `Timeout` |

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use super::{ChatChunk, ChatMessage, ChatStream, Completion, GenerateOptions, LlmClient, Role, ToolDef};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::models::ToolCall;

pub struct OpenAiClient {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ProviderError::InvalidRequest {
                provider: config.name.clone(),
                message: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self {
            name: config.name.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.resolved_api_key(),
            model: config.model.clone(),
            timeout: config.timeout(),
            client,
        })
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
        stream: bool,
    ) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("model".into(), json!(self.model));
        obj.insert(
            "messages".into(),
            Value::Array(messages.iter().map(message_to_json).collect()),
        );
        if !tools.is_empty() {
            obj.insert(
                "tools".into(),
                Value::Array(
                    tools
                        .iter()
                        .map(|t| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                }
                            })
                        })
                        .collect(),
                ),
            );
        }
        if let Some(t) = options.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(m) = options.max_tokens {
            obj.insert("max_tokens".into(), json!(m));
        }
        if let Some(p) = options.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if !options.stop.is_empty() {
            obj.insert("stop".into(), json!(options.stop));
        }
        if options.thinking {
            obj.insert("thinking".into(), json!(true));
        }
        if stream {
            obj.insert("stream".into(), json!(true));
        }
        Value::Object(obj)
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, body_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<Completion, ProviderError> {
        let body = self.build_body(messages, tools, options, false);
        let response = self.post_chat(&body).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| transport_error(&self.name, e, self.timeout))?;
        parse_completion(&self.name, &json)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<ChatStream, ProviderError> {
        let body = self.build_body(messages, tools, options, true);
        let response = self.post_chat(&body).await?;

        let provider = self.name.clone();
        let timeout = self.timeout;
        let bytes = response
            .bytes_stream()
            .map(move |r| {
                r.map(|b| b.to_vec())
                    .map_err(|e| transport_error(&provider, e, timeout))
            })
            .boxed();

        let state = StreamState {
            body: bytes,
            parser: SseParser::new(&self.name),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.finished {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(bytes)) => {
                        let items = st.parser.feed(&bytes);
                        st.finished = st.parser.is_done();
                        st.pending.extend(items);
                    }
                    Some(Err(e)) => {
                        st.pending.push_back(Err(e));
                        st.finished = true;
                    }
                    None => {
                        st.pending.extend(st.parser.finish());
                        st.finished = true;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let mut req = self.client.get(format!("{}/models", self.endpoint));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e, self.timeout))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body_text = response.text().await.unwrap_or_default();
            Err(status_error(&self.name, status, body_text))
        }
    }
}

struct StreamState {
    body: futures::stream::BoxStream<'static, Result<Vec<u8>, ProviderError>>,
    parser: SseParser,
    pending: VecDeque<Result<ChatChunk, ProviderError>>,
    finished: bool,
}

/// Map a non-success HTTP status onto the provider error taxonomy.
pub fn status_error(provider: &str, status: reqwest::StatusCode, body: String) -> ProviderError {
    let provider = provider.to_string();
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(&body, 300));
    match status.as_u16() {
        429 | 503 => ProviderError::Overloaded { provider, message },
        408 | 504 => ProviderError::Timeout {
            provider,
            elapsed: Duration::ZERO,
        },
        s if s >= 500 => ProviderError::Unavailable { provider, message },
        _ => ProviderError::InvalidRequest { provider, message },
    }
}

/// Map a transport-level `reqwest` failure.
pub fn transport_error(provider: &str, e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            elapsed: timeout,
        }
    } else {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            message: e.to_string(),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn message_to_json(m: &ChatMessage) -> Value {
    match m.role {
        Role::System => json!({"role": "system", "content": m.content}),
        Role::User => json!({"role": "user", "content": m.content}),
        Role::Tool => json!({
            "role": "tool",
            "content": m.content,
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
        }),
        Role::Assistant => {
            let mut v = json!({"role": "assistant"});
            v["content"] = if m.content.is_empty() && !m.tool_calls.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            if !m.tool_calls.is_empty() {
                v["tool_calls"] = Value::Array(
                    m.tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.tool_name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            v
        }
    }
}

/// Arguments arrive as a JSON-encoded string; keep the raw text if it does
/// not parse so schema validation reports it.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parse a `/chat/completions` response body.
pub fn parse_completion(provider: &str, json: &Value) -> Result<Completion, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Unavailable {
            provider: provider.to_string(),
            message: "invalid chat response: missing choices".into(),
        })?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, tc)| ToolCall {
                    id: tc
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| format!("call_{}", i)),
                    tool_name: tc
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: match tc.pointer("/function/arguments") {
                        Some(Value::String(s)) => parse_arguments(s),
                        Some(other) => other.clone(),
                        None => json!({}),
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Completion {
        content,
        tool_calls,
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(String::from),
    })
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Incremental Server-Sent Events parser for streamed chat completions.
///
/// Emits a [`ChatChunk::Delta`] per content fragment and a single
/// [`ChatChunk::Done`] on `data: [DONE]` (or at end of input), carrying the
/// accumulated content and tool calls ordered by their stream index.
pub struct SseParser {
    provider: String,
    buf: Vec<u8>,
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
    done: bool,
}

impl SseParser {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            buf: Vec::new(),
            content: String::new(),
            calls: BTreeMap::new(),
            finish_reason: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ChatChunk, ProviderError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while !self.done {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim(), &mut out);
        }
        out
    }

    /// Flush at end of input. Emits `Done` unless `[DONE]` was already seen.
    pub fn finish(&mut self) -> Vec<Result<ChatChunk, ProviderError>> {
        let mut out = Vec::new();
        if !self.done && !self.buf.is_empty() {
            let rest: Vec<u8> = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest);
            self.handle_line(line.trim(), &mut out);
        }
        if !self.done {
            out.push(Ok(ChatChunk::Done(self.take_completion())));
            self.done = true;
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Result<ChatChunk, ProviderError>>) {
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            out.push(Ok(ChatChunk::Done(self.take_completion())));
            self.done = true;
            return;
        }
        let json: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                out.push(Err(ProviderError::Unavailable {
                    provider: self.provider.clone(),
                    message: format!("malformed stream event: {}", e),
                }));
                return;
            }
        };
        let Some(choice) = json.pointer("/choices/0") else {
            return;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            return;
        };
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                self.content.push_str(text);
                out.push(Ok(ChatChunk::Delta(text.to_string())));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for (pos, tc) in calls.iter().enumerate() {
                let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    entry.id = Some(id.to_string());
                }
                if let Some(name) = tc.pointer("/function/name").and_then(|v| v.as_str()) {
                    entry.name.push_str(name);
                }
                if let Some(args) = tc.pointer("/function/arguments").and_then(|v| v.as_str()) {
                    entry.arguments.push_str(args);
                }
            }
        }
    }

    fn take_completion(&mut self) -> Completion {
        let calls = std::mem::take(&mut self.calls);
        Completion {
            content: std::mem::take(&mut self.content),
            tool_calls: calls
                .into_iter()
                .map(|(index, c)| ToolCall {
                    id: c.id.unwrap_or_else(|| format!("call_{}", index)),
                    tool_name: c.name,
                    arguments: parse_arguments(&c.arguments),
                })
                .collect(),
            finish_reason: self.finish_reason.take(),
        }
    }
}
