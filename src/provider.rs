use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::{Value, json};

use crate::agent::tools::ToolDefinition;
use crate::config::AgentConfig;
use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// Content block inside an in-flight request turn. Tool results are carried
/// under the user role with the correlation id the model issued.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub blocks: Vec<TurnBlock>,
}

impl ChatTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            blocks: vec![TurnBlock::Text(text.into())],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            blocks: vec![TurnBlock::Text(text.into())],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    fn parse(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A tool call requested by the model, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ModelReply {
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) if !t.is_empty() => Some(t.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    Completed(ModelReply),
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent, AgentError>>;

/// The one true external dependency: a chat-completions-with-tool-use model.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Precondition check run before any round starts.
    fn ready(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn complete(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        turns: &[ChatTurn],
    ) -> Result<ModelReply, AgentError>;

    /// Streaming variant: incremental text deltas and tool-use starts,
    /// terminated by a `Completed` aggregate.
    async fn complete_stream(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        turns: &[ChatTurn],
    ) -> Result<ProviderStream, AgentError>;
}

// ---------------------------------------------------------------------------
// Anthropic messages API
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.anthropic_api_key.clone(),
            base_url: config.anthropic_base_url.clone(),
            model: config.anthropic_model.clone(),
            max_tokens: config.anthropic_max_tokens,
        }
    }

    fn key(&self) -> Result<&str, AgentError> {
        self.api_key.as_deref().ok_or_else(|| {
            AgentError::Configuration("ANTHROPIC_API_KEY is not configured".into())
        })
    }

    fn request_body(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        turns: &[ChatTurn],
        stream: bool,
    ) -> Value {
        let tools_json: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "tools": tools_json,
            "messages": wire_messages(turns),
            "stream": stream,
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, AgentError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .header("x-api-key", self.key()?)
            .header("anthropic-version", "2023-06-01")
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Upstream(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::Upstream(format!("{status}: {text}")));
        }
        Ok(resp)
    }
}

pub fn wire_messages(turns: &[ChatTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            let mut blocks: Vec<Value> = turn
                .blocks
                .iter()
                .map(|b| match b {
                    TurnBlock::Text(text) => json!({"type": "text", "text": text}),
                    TurnBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    TurnBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let mut block = json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content,
                        });
                        if *is_error {
                            block["is_error"] = json!(true);
                        }
                        block
                    }
                })
                .collect();
            if blocks.is_empty() {
                blocks.push(json!({"type": "text", "text": ""}));
            }
            json!({"role": role, "content": blocks})
        })
        .collect()
}

pub fn parse_reply(v: &Value) -> Result<ModelReply, AgentError> {
    let content = v
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AgentError::Upstream("response missing content".into()))?;
    let mut blocks = Vec::new();
    for block in content {
        match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    blocks.push(ContentBlock::Text(text.to_string()));
                }
            }
            "tool_use" => {
                blocks.push(ContentBlock::ToolUse {
                    id: block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }
    let stop_reason = v
        .get("stop_reason")
        .and_then(|s| s.as_str())
        .map(StopReason::parse)
        .unwrap_or(StopReason::EndTurn);
    Ok(ModelReply { blocks, stop_reason })
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn ready(&self) -> Result<(), AgentError> {
        self.key().map(|_| ())
    }

    async fn complete(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        turns: &[ChatTurn],
    ) -> Result<ModelReply, AgentError> {
        let body = self.request_body(system, tools, turns, false);
        let resp = self.send(&body).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| AgentError::Upstream(e.to_string()))?;
        parse_reply(&v)
    }

    async fn complete_stream(
        &self,
        system: &str,
        tools: &[ToolDefinition],
        turns: &[ChatTurn],
    ) -> Result<ProviderStream, AgentError> {
        let body = self.request_body(system, tools, turns, true);
        let resp = self.send(&body).await?;
        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut buf = SseLineBuffer::new();
            let mut state = StreamState::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(AgentError::Upstream(e.to_string()));
                        return;
                    }
                };
                for data in buf.feed(&chunk) {
                    let Ok(v) = serde_json::from_str::<Value>(&data) else {
                        continue;
                    };
                    match state.apply(&v) {
                        Ok(events) => {
                            for ev in events {
                                yield Ok(ev);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(reply) = state.finish() {
                yield Ok(ProviderEvent::Completed(reply));
            }
        };
        Ok(Box::pin(stream))
    }
}

// ---------------------------------------------------------------------------
// SSE plumbing
// ---------------------------------------------------------------------------

/// Line-buffering SSE parser. TCP chunks do not align with event boundaries,
/// so partial lines are held until the terminating newline arrives.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning the `data:` payloads of every complete event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_owned();
            self.buffer = self.buffer[pos + 1..].to_owned();
            let trimmed = line.trim();
            if let Some(data) = trimmed.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    out.push(data.to_owned());
                }
            }
            // event:/id:/retry: fields and comment lines carry nothing we need
        }
        out
    }
}

#[derive(Debug)]
enum BlockAccum {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

/// Interprets the Anthropic streaming event sequence, accumulating content
/// blocks per index until the final aggregate can be assembled.
#[derive(Debug, Default)]
pub struct StreamState {
    blocks: Vec<BlockAccum>,
    stop_reason: Option<StopReason>,
    completed: bool,
}

impl StreamState {
    pub fn apply(&mut self, v: &Value) -> Result<Vec<ProviderEvent>, AgentError> {
        let kind = v.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match kind {
            "content_block_start" => {
                let block = v.get("content_block").cloned().unwrap_or_default();
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "tool_use" => {
                        let id = block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string();
                        self.blocks.push(BlockAccum::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input_json: String::new(),
                        });
                        Ok(vec![ProviderEvent::ToolUseStart { id, name }])
                    }
                    _ => {
                        let text = block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string();
                        self.blocks.push(BlockAccum::Text(text));
                        Ok(Vec::new())
                    }
                }
            }
            "content_block_delta" => {
                let delta = v.get("delta").cloned().unwrap_or_default();
                match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text_delta" => {
                        let text = delta
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if let Some(BlockAccum::Text(acc)) = self.blocks.last_mut() {
                            acc.push_str(&text);
                        }
                        if text.is_empty() {
                            Ok(Vec::new())
                        } else {
                            Ok(vec![ProviderEvent::TextDelta(text)])
                        }
                    }
                    "input_json_delta" => {
                        if let Some(BlockAccum::ToolUse { input_json, .. }) =
                            self.blocks.last_mut()
                        {
                            input_json.push_str(
                                delta
                                    .get("partial_json")
                                    .and_then(|p| p.as_str())
                                    .unwrap_or_default(),
                            );
                        }
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "message_delta" => {
                if let Some(reason) = v
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|s| s.as_str())
                {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                Ok(Vec::new())
            }
            "message_stop" => {
                self.completed = true;
                Ok(vec![ProviderEvent::Completed(self.assemble())])
            }
            "error" => {
                let message = v
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("stream error")
                    .to_string();
                Err(AgentError::Upstream(message))
            }
            // message_start / content_block_stop / ping carry nothing we track
            _ => Ok(Vec::new()),
        }
    }

    /// Aggregate for streams that end without an explicit `message_stop`.
    pub fn finish(&mut self) -> Option<ModelReply> {
        if self.completed {
            return None;
        }
        self.completed = true;
        Some(self.assemble())
    }

    fn assemble(&self) -> ModelReply {
        let blocks = self
            .blocks
            .iter()
            .map(|b| match b {
                BlockAccum::Text(t) => ContentBlock::Text(t.clone()),
                BlockAccum::ToolUse {
                    id,
                    name,
                    input_json,
                } => ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: serde_json::from_str(input_json).unwrap_or_else(|_| json!({})),
                },
            })
            .collect();
        ModelReply {
            blocks,
            stop_reason: self.stop_reason.clone().unwrap_or(StopReason::EndTurn),
        }
    }
}
