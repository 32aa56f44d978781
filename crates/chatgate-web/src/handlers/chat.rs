//! Chat API Handlers

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chatgate_chat::{ChatEvent, ExchangeOutcome};
use chatgate_core::{Error, ToolCallRequest, ToolCallResult};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChatBody {
    Request(ChatRequest),
    Text(String),
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub message: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_results: Vec<ToolCallResult>,
    pub rounds: usize,
}

impl From<ExchangeOutcome> for ChatResponse {
    fn from(outcome: ExchangeOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            message: outcome.message.content,
            tool_calls: outcome.tool_calls,
            tool_results: outcome.tool_results,
            rounds: outcome.rounds,
        }
    }
}

/// Parse a chat body: a JSON object, a bare JSON string, or plain text.
fn parse_request(headers: &HeaderMap, body: &Bytes) -> Result<ChatRequest, Error> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    let request = if is_json {
        match serde_json::from_slice::<ChatBody>(body)
            .map_err(|e| Error::invalid_input(format!("invalid chat request: {}", e)))?
        {
            ChatBody::Request(request) => request,
            ChatBody::Text(message) => ChatRequest {
                message,
                session_id: None,
                stream: false,
            },
        }
    } else {
        let message = std::str::from_utf8(body)
            .map_err(|_| Error::invalid_input("request body is not valid UTF-8"))?;
        ChatRequest {
            message: message.to_string(),
            session_id: None,
            stream: false,
        }
    };

    if request.message.trim().is_empty() {
        return Err(Error::invalid_input("message must not be empty"));
    }
    Ok(request)
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

/// POST /chat - one user message, answered in full or as an SSE stream
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_request(&headers, &body)?;
    let stream = request.stream || wants_event_stream(&headers);
    info!("Chat request: {} chars (stream: {})", request.message.len(), stream);

    let session_id = match request.session_id {
        Some(id) => {
            if !state.sessions.contains(&id).await {
                return Err(Error::session_not_found(id).into());
            }
            id
        }
        None => state.sessions.create().await.id,
    };

    // Busy and missing sessions are reported before any body is sent
    let guard = state.orchestrator.begin(&session_id).await?;

    if !stream {
        let outcome = state
            .orchestrator
            .run(guard, &request.message, None, CancellationToken::new())
            .await?;
        return Ok(Json(ChatResponse::from(outcome)).into_response());
    }

    let (tx, mut rx) = mpsc::channel::<ChatEvent>(64);
    let cancel = CancellationToken::new();
    let drop_guard = cancel.clone().drop_guard();

    let orchestrator = state.orchestrator.clone();
    let message = request.message;
    tokio::spawn(async move {
        let _ = orchestrator.run(guard, &message, Some(tx), cancel).await;
    });

    let session_event = Event::default()
        .event("session")
        .data(serde_json::json!({ "session_id": session_id }).to_string());

    let stream = async_stream::stream! {
        // Dropping the body (client gone) cancels the exchange
        let _drop_guard = drop_guard;
        yield Ok::<_, Infallible>(session_event);
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            yield Ok(sse_event(&event));
            if terminal {
                break;
            }
        }
        debug!("Chat stream finished");
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

fn sse_event(event: &ChatEvent) -> Event {
    let name = match event {
        ChatEvent::Chunk { .. } => "chunk",
        ChatEvent::ToolCall { .. } => "tool_call",
        ChatEvent::ToolResult { .. } => "tool_result",
        ChatEvent::Done { .. } => "done",
        ChatEvent::Failed { .. } => "error",
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(event).unwrap_or_default())
}
