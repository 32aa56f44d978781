//! Anthropic Claude API Provider
//!
//! ## API Endpoints
//!
//! | Endpoint | URL | Purpose |
//! |----------|-----|--------|
//! | Base URL | `https://api.anthropic.com/v1` | All Claude APIs |
//! | Messages | `/messages` | Chat completions (`stream: true`) |
//!
//! ## Authentication
//! - Header: `x-api-key: {ANTHROPIC_API_KEY}`
//! - Header: `anthropic-version: 2023-06-01`
//!
//! ## Streaming
//! Text arrives as `text_delta`s. Tool calls arrive as a `tool_use` block whose
//! JSON input is streamed in `input_json_delta` fragments; the call is emitted
//! once the block closes.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use chatgate_core::config::ModelSettings;
use chatgate_core::{Error, Message, Result, Role, ToolCallRequest, ToolDefinition};

use crate::http::{build_client, check_status, map_reqwest_error};
use crate::provider::{EventStream, LlmProvider, ModelEvent, ModelRequest, ProviderType};
use crate::sse::{decode_frames, sse_events, FrameDecoder, SseEvent};

// =============================================================================
// API ENDPOINT CONFIGURATION
// =============================================================================

pub mod endpoints {
    pub const BASE_URL: &str = "https://api.anthropic.com/v1";
    pub const MESSAGES: &str = "/messages";
    pub const API_VERSION: &str = "2023-06-01";
}

// =============================================================================
// REQUEST STRUCTURES
// =============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

fn tool_format(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema
    })
}

/// Convert the transcript into Anthropic's alternating user/assistant turns.
///
/// A tool message becomes a `tool_use` block on the assistant side followed by
/// a `tool_result` block on the user side. Adjacent turns with the same role
/// are merged.
fn to_anthropic_messages(transcript: &[Message]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::new();

    fn push(out: &mut Vec<AnthropicMessage>, role: &'static str, block: ContentBlock) {
        match out.last_mut() {
            Some(last) if last.role == role => last.content.push(block),
            _ => out.push(AnthropicMessage {
                role,
                content: vec![block],
            }),
        }
    }

    for message in transcript {
        match message.role {
            Role::User => push(&mut out, "user", ContentBlock::Text { text: message.content.clone() }),
            Role::Assistant => {
                if !message.content.is_empty() {
                    push(&mut out, "assistant", ContentBlock::Text { text: message.content.clone() });
                }
            }
            Role::Tool => {
                let (Some(call), Some(result)) = (&message.tool_call, &message.tool_result) else {
                    continue;
                };
                push(
                    &mut out,
                    "assistant",
                    ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    },
                );
                push(
                    &mut out,
                    "user",
                    ContentBlock::ToolResult {
                        tool_use_id: result.call_id.clone(),
                        content: message.content.clone(),
                        is_error: !result.success,
                    },
                );
            }
        }
    }

    out
}

// =============================================================================
// STREAM DECODING
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {},
    ContentBlockStart { index: usize, content_block: StartBlock },
    ContentBlockDelta { index: usize, delta: BlockDelta },
    ContentBlockStop { index: usize },
    MessageDelta { delta: MessageDeltaBody },
    MessageStop,
    Ping,
    Error { error: ApiError },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {},
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

impl ApiError {
    fn into_error(self) -> Error {
        let message = format!("Anthropic stream error ({}): {}", self.kind, self.message);
        match self.kind.as_str() {
            "rate_limit_error" => Error::rate_limited(message, None),
            "overloaded_error" => Error::upstream(Some(529), message),
            "api_error" => Error::upstream(Some(500), message),
            _ => Error::upstream(Some(400), message),
        }
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Accumulates `tool_use` blocks across deltas
#[derive(Debug, Default)]
struct AnthropicDecoder {
    tool_blocks: HashMap<usize, PendingToolUse>,
    stop_reason: Option<String>,
    finished: bool,
}

impl FrameDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &SseEvent) -> Result<Vec<ModelEvent>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let event: StreamEvent = serde_json::from_str(&frame.data).map_err(|e| {
            Error::malformed(format!("undecodable Anthropic stream event: {} ({})", e, frame.data))
        })?;

        let mut out = Vec::new();
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block: StartBlock::ToolUse { id, name },
            } => {
                self.tool_blocks.insert(
                    index,
                    PendingToolUse {
                        id,
                        name,
                        input_json: String::new(),
                    },
                );
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if !text.is_empty() {
                        out.push(ModelEvent::chunk(text));
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    let pending = self.tool_blocks.get_mut(&index).ok_or_else(|| {
                        Error::malformed(format!("input_json_delta for unknown block {}", index))
                    })?;
                    pending.input_json.push_str(&partial_json);
                }
                BlockDelta::Other => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(pending) = self.tool_blocks.remove(&index) {
                    let arguments = if pending.input_json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&pending.input_json).map_err(|e| {
                            Error::malformed(format!(
                                "tool '{}' arguments are not valid JSON: {}",
                                pending.name, e
                            ))
                        })?
                    };
                    out.push(ModelEvent::tool_call(ToolCallRequest::with_id(
                        pending.id,
                        pending.name,
                        arguments,
                    )));
                }
            }
            StreamEvent::MessageDelta { delta } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
            }
            StreamEvent::MessageStop => {
                self.finished = true;
                out.push(ModelEvent::done(self.stop_reason.as_deref()));
            }
            StreamEvent::Error { error } => return Err(error.into_error()),
            StreamEvent::MessageStart {}
            | StreamEvent::ContentBlockStart { .. }
            | StreamEvent::Ping
            | StreamEvent::Unknown => {}
        }
        Ok(out)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

// =============================================================================
// PROVIDER IMPLEMENTATION
// =============================================================================

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings.request_timeout)?,
            api_key: settings.api_key.clone(),
            api_url: settings.base_url.clone(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn open_stream(&self, request: &ModelRequest) -> Result<EventStream> {
        let url = format!("{}{}", self.api_url, endpoints::MESSAGES);

        let body = AnthropicRequest {
            model: &self.model,
            messages: to_anthropic_messages(&request.messages),
            max_tokens: self.max_tokens,
            system: Some(request.system.as_str()).filter(|s| !s.is_empty()),
            tools: request.tools.iter().map(tool_format).collect(),
            stream: true,
        };

        debug!(
            "Anthropic request to {} ({} messages, {} tools)",
            url,
            body.messages.len(),
            body.tools.len()
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", endpoints::API_VERSION)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let response = check_status("Anthropic", response).await?;
        let frames = sse_events(response.bytes_stream());
        Ok(Box::pin(decode_frames(frames, AnthropicDecoder::default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::ToolCallResult;
    use futures::{stream, StreamExt};
    use serde_json::json;

    fn frame(data: &str) -> Result<SseEvent> {
        Ok(SseEvent {
            event: None,
            data: data.to_string(),
        })
    }

    async fn decode(frames: Vec<Result<SseEvent>>) -> Vec<Result<ModelEvent>> {
        decode_frames(stream::iter(frames), AnthropicDecoder::default())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_text_then_tool_use() {
        let events = decode(vec![
            frame(r#"{"type":"message_start","message":{"id":"msg_1"}}"#),
            frame(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            frame(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Let me add."}}"#),
            frame(r#"{"type":"content_block_stop","index":0}"#),
            frame(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"add","input":{}}}"#),
            frame(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\": 2"}}"#),
            frame(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":", \"b\": 3}"}}"#),
            frame(r#"{"type":"content_block_stop","index":1}"#),
            frame(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}"#),
            frame(r#"{"type":"message_stop"}"#),
        ])
        .await;

        let events: Vec<ModelEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ModelEvent::chunk("Let me add."),
                ModelEvent::tool_call(ToolCallRequest::with_id("toolu_1", "add", json!({"a": 2, "b": 3}))),
                ModelEvent::done(Some("tool_use")),
            ]
        );
    }

    #[tokio::test]
    async fn test_broken_tool_json_is_malformed() {
        let events = decode(vec![
            frame(r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t","name":"add"}}"#),
            frame(r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"a\": "}}"#),
            frame(r#"{"type":"content_block_stop","index":0}"#),
        ])
        .await;
        let err = events.into_iter().find_map(|e| e.err()).unwrap();
        assert_eq!(err.kind(), "malformed_output");
    }

    #[tokio::test]
    async fn test_overloaded_error_event_is_retryable() {
        let events = decode(vec![frame(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )])
        .await;
        let err = events.into_iter().next().unwrap().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_transcript_conversion_alternates_roles() {
        let call = ToolCallRequest::with_id("toolu_1", "add", json!({"a": 2, "b": 3}));
        let result = ToolCallResult::success("toolu_1", json!(5), 1);
        let transcript = vec![
            Message::user("What is 2+3?"),
            Message::assistant("Let me add."),
            Message::tool(call, result),
        ];

        let messages = to_anthropic_messages(&transcript);
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(messages[1].content.len(), 2);
        assert_eq!(
            messages[2].content[0],
            ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "5".to_string(),
                is_error: false,
            }
        );
    }
}
