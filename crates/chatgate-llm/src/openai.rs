//! OpenAI Chat Completions Provider
//!
//! Works against `api.openai.com` and any OpenAI-compatible endpoint set via
//! `OPENAI_BASE_URL`.
//!
//! Streaming tool calls arrive as `delta.tool_calls` fragments keyed by
//! `index`; names and ids come in the first fragment, arguments are a JSON
//! string split across the rest. Calls are assembled when the choice reports
//! its `finish_reason`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use chatgate_core::config::ModelSettings;
use chatgate_core::{Error, Message, Result, Role, ToolCallRequest, ToolDefinition};

use crate::http::{build_client, check_status, map_reqwest_error};
use crate::provider::{EventStream, LlmProvider, ModelEvent, ModelRequest, ProviderType};
use crate::sse::{decode_frames, sse_events, FrameDecoder, SseEvent};

pub mod endpoints {
    pub const BASE_URL: &str = "https://api.openai.com/v1";
    pub const CHAT_COMPLETIONS: &str = "/chat/completions";
}

// =============================================================================
// REQUEST STRUCTURES
// =============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionCall,
}

#[derive(Debug, Serialize, PartialEq)]
struct FunctionCall {
    name: String,
    arguments: String,
}

fn tool_format(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema
        }
    })
}

fn to_openai_messages(system: &str, transcript: &[Message]) -> Vec<OpenAiMessage> {
    let mut out = Vec::with_capacity(transcript.len() + 1);
    if !system.is_empty() {
        out.push(OpenAiMessage::text("system", system));
    }

    for message in transcript {
        match message.role {
            Role::User => out.push(OpenAiMessage::text("user", &message.content)),
            Role::Assistant => {
                if !message.content.is_empty() {
                    out.push(OpenAiMessage::text("assistant", &message.content));
                }
            }
            Role::Tool => {
                let (Some(call), Some(result)) = (&message.tool_call, &message.tool_result) else {
                    continue;
                };
                let tool_call = OpenAiToolCall {
                    id: call.id.clone(),
                    kind: "function",
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                };
                // Text that preceded the call rides on the same assistant turn
                match out.last_mut() {
                    Some(last) if last.role == "assistant" => last.tool_calls.push(tool_call),
                    _ => out.push(OpenAiMessage {
                        role: "assistant",
                        content: None,
                        tool_calls: vec![tool_call],
                        tool_call_id: None,
                    }),
                }
                out.push(OpenAiMessage {
                    role: "tool",
                    content: Some(message.content.clone()),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(result.call_id.clone()),
                });
            }
        }
    }

    out
}

// =============================================================================
// STREAM DECODING
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

impl ApiError {
    fn into_error(self) -> Error {
        let kind = self.kind.unwrap_or_default();
        let code = self.code.map(|c| c.to_string()).unwrap_or_default();
        let message = format!("OpenAI stream error ({}): {}", kind, self.message);
        if kind.contains("rate_limit") || code.contains("rate_limit") {
            Error::rate_limited(message, None)
        } else if kind.contains("server_error") {
            Error::upstream(Some(500), message)
        } else {
            Error::upstream(Some(400), message)
        }
    }
}

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates tool-call fragments by index
#[derive(Debug, Default)]
struct OpenAiDecoder {
    pending: BTreeMap<usize, PendingCall>,
    finished: bool,
}

impl OpenAiDecoder {
    fn finish(&mut self, finish_reason: Option<String>, out: &mut Vec<ModelEvent>) -> Result<()> {
        for (_, call) in std::mem::take(&mut self.pending) {
            if call.name.is_empty() {
                return Err(Error::malformed("streamed tool call is missing its function name"));
            }
            let arguments = if call.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.arguments).map_err(|e| {
                    Error::malformed(format!(
                        "tool '{}' arguments are not valid JSON: {}",
                        call.name, e
                    ))
                })?
            };
            let request = match call.id {
                Some(id) if !id.is_empty() => ToolCallRequest::with_id(id, call.name, arguments),
                _ => ToolCallRequest::new(call.name, arguments),
            };
            out.push(ModelEvent::tool_call(request));
        }
        self.finished = true;
        out.push(ModelEvent::done(finish_reason.as_deref()));
        Ok(())
    }
}

impl FrameDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: &SseEvent) -> Result<Vec<ModelEvent>> {
        let mut out = Vec::new();

        if frame.is_done_marker() {
            if !self.finished {
                self.finish(None, &mut out)?;
            }
            return Ok(out);
        }
        if frame.data.trim().is_empty() {
            return Ok(out);
        }

        let payload: ChunkPayload = serde_json::from_str(&frame.data).map_err(|e| {
            Error::malformed(format!("undecodable OpenAI stream chunk: {} ({})", e, frame.data))
        })?;

        if let Some(error) = payload.error {
            return Err(error.into_error());
        }

        for choice in payload.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    out.push(ModelEvent::chunk(text));
                }
            }
            for fragment in choice.delta.tool_calls {
                let call = self.pending.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    call.id = Some(id);
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish(choice.finish_reason, &mut out)?;
                break;
            }
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

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiProvider {
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
impl LlmProvider for OpenAiProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn open_stream(&self, request: &ModelRequest) -> Result<EventStream> {
        let url = format!("{}{}", self.api_url, endpoints::CHAT_COMPLETIONS);

        let body = OpenAiRequest {
            model: &self.model,
            messages: to_openai_messages(&request.system, &request.messages),
            max_tokens: self.max_tokens,
            tools: request.tools.iter().map(tool_format).collect(),
            stream: true,
        };

        debug!(
            "OpenAI request to {} ({} messages, {} tools)",
            url,
            body.messages.len(),
            body.tools.len()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let response = check_status("OpenAI", response).await?;
        let frames = sse_events(response.bytes_stream());
        Ok(Box::pin(decode_frames(frames, OpenAiDecoder::default())))
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
        decode_frames(stream::iter(frames), OpenAiDecoder::default())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_text_stream() {
        let events = decode(vec![
            frame(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"The result"}}]}"#),
            frame(r#"{"choices":[{"index":0,"delta":{"content":" is 5."}}]}"#),
            frame(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#),
            frame("[DONE]"),
        ])
        .await;
        let events: Vec<ModelEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ModelEvent::chunk("The result"),
                ModelEvent::chunk(" is 5."),
                ModelEvent::done(Some("stop")),
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_call_fragments_assembled() {
        let events = decode(vec![
            frame(r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","type":"function","function":{"name":"add","arguments":""}}]}}]}"#),
            frame(r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":2,"}}]}}]}"#),
            frame(r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"b\":3}"}}]}}]}"#),
            frame(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#),
        ])
        .await;
        let events: Vec<ModelEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ModelEvent::tool_call(ToolCallRequest::with_id("call_abc", "add", json!({"a": 2, "b": 3}))),
                ModelEvent::done(Some("tool_calls")),
            ]
        );
    }

    #[tokio::test]
    async fn test_done_marker_without_finish_reason() {
        let events = decode(vec![
            frame(r#"{"choices":[{"index":0,"delta":{"content":"hi"}}]}"#),
            frame("[DONE]"),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].as_ref().unwrap(), &ModelEvent::done(None));
    }

    #[tokio::test]
    async fn test_garbage_chunk_is_malformed() {
        let events = decode(vec![frame("{not json")]).await;
        assert_eq!(events[0].as_ref().unwrap_err().kind(), "malformed_output");
    }

    #[test]
    fn test_transcript_conversion() {
        let call = ToolCallRequest::with_id("call_1", "add", json!({"a": 2, "b": 3}));
        let result = ToolCallResult::success("call_1", json!(5), 1);
        let transcript = vec![Message::user("What is 2+3?"), Message::tool(call, result)];

        let messages = to_openai_messages("Be brief.", &transcript);
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
        assert_eq!(messages[2].tool_calls[0].function.arguments, r#"{"a":2,"b":3}"#);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));
    }
}
