//! WebSocket Handler for Real-time Chat
//!
//! One connection drives one session. Client frames are either plain text or
//! JSON (`{"type":"chat","message":..}`, `{"type":"ping"}`). Exchanges on a
//! connection run one after another; closing the socket cancels the running
//! exchange.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatgate_chat::{ChatEvent, RoundGuard};
use chatgate_core::{BusyPolicy, Error, ToolCallRequest, ToolCallResult};

use crate::error::ApiError;
use crate::state::AppState;

/// Frames sent by the client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Chat { message: String },
    Ping,
}

/// Frames sent by the server
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Session { session_id: String },
    Chunk { text: String },
    ToolCall { call: ToolCallRequest },
    ToolResult { result: ToolCallResult },
    Done { message: String },
    Error { kind: String, message: String },
    Pong,
}

impl From<ChatEvent> for ServerFrame {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::Chunk { text } => ServerFrame::Chunk { text },
            ChatEvent::ToolCall { call } => ServerFrame::ToolCall { call },
            ChatEvent::ToolResult { result } => ServerFrame::ToolResult { result },
            ChatEvent::Done { message } => ServerFrame::Done {
                message: message.content,
            },
            ChatEvent::Failed { kind, message } => ServerFrame::Error { kind, message },
        }
    }
}

impl From<&Error> for ServerFrame {
    fn from(error: &Error) -> Self {
        ServerFrame::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Interpret one text frame.
pub fn parse_frame(text: &str) -> Option<ClientFrame> {
    if let Ok(frame) = serde_json::from_str::<ClientFrame>(text) {
        return Some(frame);
    }
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(ClientFrame::Chat {
            message: text.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let (session_id, owned) = match params.session_id {
        Some(id) => {
            if !state.sessions.contains(&id).await {
                return Err(Error::session_not_found(id).into());
            }
            (id, false)
        }
        None => (state.sessions.create().await.id, true),
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, owned)))
}

/// Messages a connection may have waiting behind the running exchange
pub const MAX_QUEUED_MESSAGES: usize = 8;

/// A message waiting for the connection's worker
struct Job {
    message: String,
    /// Round permit taken up front under the reject policy
    guard: Option<RoundGuard>,
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String, owned: bool) {
    let (mut sender, mut receiver) = socket.split();
    info!(session_id = %session_id, "WebSocket connected");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);
    let (job_tx, job_rx) = mpsc::channel::<Job>(MAX_QUEUED_MESSAGES);
    let cancel = CancellationToken::new();

    let _ = out_tx
        .send(ServerFrame::Session {
            session_id: session_id.clone(),
        })
        .await;

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let worker = tokio::spawn(run_worker(
        Arc::clone(&state),
        session_id.clone(),
        job_rx,
        out_tx.clone(),
        cancel.clone(),
    ));

    let recv_state = Arc::clone(&state);
    let recv_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            match parse_frame(&text) {
                Some(ClientFrame::Ping) => {
                    let _ = out_tx.send(ServerFrame::Pong).await;
                }
                Some(ClientFrame::Chat { message }) => {
                    let orchestrator = &recv_state.orchestrator;
                    let guard = match orchestrator.config().busy_policy {
                        BusyPolicy::Reject => match orchestrator.begin(&recv_session).await {
                            Ok(guard) => Some(guard),
                            Err(e) => {
                                debug!(session_id = %recv_session, "Rejecting message: {}", e);
                                let _ = out_tx.send(ServerFrame::from(&e)).await;
                                continue;
                            }
                        },
                        BusyPolicy::Queue => None,
                    };
                    match job_tx.try_send(Job { message, guard }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!(session_id = %recv_session, "Message queue full");
                            let busy = Error::session_busy(&recv_session);
                            let _ = out_tx.send(ServerFrame::from(&busy)).await;
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                None => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    cancel.cancel();
    let _ = worker.await;

    if owned {
        state.sessions.close(&session_id).await;
    }
    info!(session_id = %session_id, "WebSocket disconnected");
}

/// Run queued messages one at a time, relaying events to the socket.
async fn run_worker(
    state: Arc<AppState>,
    session_id: String,
    mut jobs: mpsc::Receiver<Job>,
    out_tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        let guard = match job.guard {
            Some(guard) => guard,
            None => {
                let acquired = tokio::select! {
                    _ = cancel.cancelled() => return,
                    acquired = state.orchestrator.begin(&session_id) => acquired,
                };
                match acquired {
                    Ok(guard) => guard,
                    Err(e) => {
                        let _ = out_tx.send(ServerFrame::from(&e)).await;
                        continue;
                    }
                }
            }
        };

        let (event_tx, mut event_rx) = mpsc::channel::<ChatEvent>(64);
        let run = state
            .orchestrator
            .run(guard, &job.message, Some(event_tx), cancel.child_token());
        let relay = async {
            while let Some(event) = event_rx.recv().await {
                if out_tx.send(ServerFrame::from(event)).await.is_err() {
                    break;
                }
            }
        };

        let (result, _) = tokio::join!(run, relay);
        if let Err(Error::Cancelled) = result {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::Message as ChatMessage;
    use serde_json::json;

    #[test]
    fn test_parse_frames() {
        assert!(matches!(parse_frame(r#"{"type":"ping"}"#), Some(ClientFrame::Ping)));
        match parse_frame(r#"{"type":"chat","message":"hello"}"#) {
            Some(ClientFrame::Chat { message }) => assert_eq!(message, "hello"),
            other => panic!("unexpected frame {:?}", other),
        }
        match parse_frame("  just text ") {
            Some(ClientFrame::Chat { message }) => assert_eq!(message, "just text"),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(parse_frame("   ").is_none());
    }

    #[test]
    fn test_server_frames_serialize_with_type_tag() {
        let frame = ServerFrame::from(ChatEvent::Chunk { text: "hi".into() });
        assert_eq!(serde_json::to_value(&frame).unwrap(), json!({"type": "chunk", "text": "hi"}));

        let frame = ServerFrame::from(ChatEvent::Done {
            message: ChatMessage::assistant("The result is 5."),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "done", "message": "The result is 5."})
        );

        let frame = ServerFrame::from(&Error::session_busy("abc"));
        assert_eq!(serde_json::to_value(&frame).unwrap()["kind"], "session_busy");
    }
}
