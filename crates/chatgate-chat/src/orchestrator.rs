//! Chat Orchestrator
//!
//! Drives one exchange (one client message) through the round state machine:
//!
//! ```text
//! AwaitingModel -> Streaming -> Complete
//!                      |
//!                      v
//!               DispatchingTool -> AwaitingModel ...
//! ```
//!
//! Any unrecoverable error moves the exchange to `Failed`; the transcript is
//! not touched afterwards. Tool round-trips are capped per exchange.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatgate_core::{Error, Message, Result, ToolCallRequest};
use chatgate_llm::{ModelEvent, ModelGateway};
use chatgate_tools::ToolDispatcher;

use crate::session::{RoundGuard, SessionRegistry};
use crate::types::{ChatEvent, ExchangeOutcome, OrchestratorConfig, RoundState};

/// Sink for events of one exchange; `None` when the caller only wants the outcome
pub type EventSink = Option<mpsc::Sender<ChatEvent>>;

/// Coordinates sessions, the model gateway and the tool dispatcher
#[derive(Clone)]
pub struct ChatOrchestrator {
    sessions: Arc<SessionRegistry>,
    gateway: ModelGateway,
    dispatcher: ToolDispatcher,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        gateway: ModelGateway,
        dispatcher: ToolDispatcher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            gateway,
            dispatcher,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Acquire the session's round permit according to the busy policy.
    pub async fn begin(&self, session_id: &str) -> Result<RoundGuard> {
        self.sessions
            .begin_round(session_id, self.config.busy_policy)
            .await
    }

    /// Acquire the permit and run an exchange.
    pub async fn chat(
        &self,
        session_id: &str,
        input: &str,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome> {
        let guard = self.begin(session_id).await?;
        self.run(guard, input, events, cancel).await
    }

    /// Run one exchange under an acquired round permit.
    ///
    /// Terminal `Done`/`Failed` events are sent to `events`. Cancellation (via
    /// `cancel`, or because the event receiver was dropped) abandons the model
    /// stream and any running tool; nothing further is appended.
    pub async fn run(
        &self,
        guard: RoundGuard,
        input: &str,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome> {
        let session_id = guard.session_id().to_string();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.exchange(&session_id, input, &events) => result,
        };
        drop(guard);

        match &result {
            Ok(outcome) => {
                info!(
                    session_id = %session_id,
                    rounds = outcome.rounds,
                    tool_calls = outcome.tool_calls.len(),
                    "Exchange complete"
                );
                let _ = emit(
                    &events,
                    ChatEvent::Done {
                        message: outcome.message.clone(),
                    },
                )
                .await;
            }
            Err(Error::Cancelled) => {
                info!(session_id = %session_id, "Exchange cancelled by client");
            }
            Err(e) => {
                debug!(session_id = %session_id, "Round state -> {:?}", RoundState::Failed);
                warn!(session_id = %session_id, "Exchange failed: {}", e);
                let _ = emit(&events, ChatEvent::failed(e)).await;
            }
        }
        result
    }

    async fn exchange(
        &self,
        session_id: &str,
        input: &str,
        events: &EventSink,
    ) -> Result<ExchangeOutcome> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::invalid_input("message must not be empty"));
        }

        self.sessions.append(session_id, Message::user(input)).await?;

        let tools = self.dispatcher.registry().list().await;
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let mut tool_results = Vec::new();
        let mut state = RoundState::AwaitingModel;

        for round in 0..=self.config.max_tool_rounds {
            let transcript = self.sessions.transcript(session_id).await?;
            advance(&mut state, RoundState::Streaming, session_id);
            debug!(
                session_id = %session_id,
                round,
                "Requesting completion ({} messages)",
                transcript.len()
            );

            let mut stream = self.gateway.stream(&transcript, &tools);
            let mut text = String::new();
            let mut requested: Vec<ToolCallRequest> = Vec::new();

            loop {
                match stream.next().await {
                    Some(Ok(ModelEvent::Chunk { text: piece })) => {
                        text.push_str(&piece);
                        emit(events, ChatEvent::Chunk { text: piece }).await?;
                    }
                    Some(Ok(ModelEvent::ToolCall { call })) => requested.push(call),
                    Some(Ok(ModelEvent::Done { finish_reason })) => {
                        debug!(
                            session_id = %session_id,
                            round,
                            "Model finished: {:?}",
                            finish_reason
                        );
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(Error::upstream(
                            None,
                            "model stream ended without a terminal marker",
                        ))
                    }
                }
            }
            drop(stream);

            if requested.is_empty() {
                advance(&mut state, RoundState::Complete, session_id);
                let message = Message::assistant(text);
                self.sessions.append(session_id, message.clone()).await?;
                return Ok(ExchangeOutcome {
                    session_id: session_id.to_string(),
                    message,
                    tool_calls,
                    tool_results,
                    rounds: round + 1,
                });
            }

            if round == self.config.max_tool_rounds {
                break;
            }

            advance(&mut state, RoundState::DispatchingTool, session_id);
            if !text.is_empty() {
                self.sessions.append(session_id, Message::assistant(text)).await?;
            }

            let mut seen: HashSet<String> = transcript
                .iter()
                .filter_map(|m| m.tool_call.as_ref().map(|c| c.id.clone()))
                .chain(tool_calls.iter().map(|c| c.id.clone()))
                .collect();

            for mut call in requested {
                // Providers occasionally reuse ids; each request instance runs once
                if !seen.insert(call.id.clone()) {
                    let fresh = ToolCallRequest::new(call.name.clone(), call.arguments.clone());
                    warn!(
                        "Tool call id '{}' reused by model, reassigned to '{}'",
                        call.id, fresh.id
                    );
                    call.id = fresh.id;
                    seen.insert(call.id.clone());
                }

                info!(
                    session_id = %session_id,
                    tool = %call.name,
                    call_id = %call.id,
                    "Dispatching tool call"
                );
                if self.config.expose_tool_events {
                    emit(events, ChatEvent::ToolCall { call: call.clone() }).await?;
                }

                // Provider ids only need to be unique within this session
                let result = self.dispatcher.invoke_scoped(session_id, &call).await;
                if !result.success {
                    warn!(
                        session_id = %session_id,
                        tool = %call.name,
                        "Tool call failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                if self.config.expose_tool_events {
                    emit(
                        events,
                        ChatEvent::ToolResult {
                            result: result.clone(),
                        },
                    )
                    .await?;
                }

                self.sessions
                    .append(session_id, Message::tool(call.clone(), result.clone()))
                    .await?;
                tool_calls.push(call);
                tool_results.push(result);
            }

            advance(&mut state, RoundState::AwaitingModel, session_id);
        }

        warn!(
            session_id = %session_id,
            "Model still requesting tools after {} rounds",
            self.config.max_tool_rounds
        );
        Err(Error::LoopLimit(self.config.max_tool_rounds))
    }
}

fn advance(state: &mut RoundState, next: RoundState, session_id: &str) {
    debug!(session_id = %session_id, "Round state {:?} -> {:?}", state, next);
    *state = next;
}

/// Send an event; a closed receiver means the client is gone.
async fn emit(events: &EventSink, event: ChatEvent) -> Result<()> {
    match events {
        Some(tx) => tx.send(event).await.map_err(|_| Error::Cancelled),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::{BusyPolicy, Role};
    use chatgate_llm::{GatewayConfig, ScriptedProvider, ScriptedRound};
    use chatgate_tools::ToolRegistry;
    use serde_json::json;

    async fn orchestrator(
        provider: Arc<ScriptedProvider>,
        config: OrchestratorConfig,
    ) -> ChatOrchestrator {
        let registry = Arc::new(ToolRegistry::new());
        chatgate_tools::register_builtin_tools(&registry).await.unwrap();
        ChatOrchestrator::new(
            Arc::new(SessionRegistry::new()),
            ModelGateway::new(provider, GatewayConfig::default()),
            ToolDispatcher::with_defaults(registry),
            config,
        )
    }

    #[tokio::test]
    async fn test_plain_reply() {
        let rounds = vec![ScriptedRound::text(&["Hello", " there"])];
        let provider = Arc::new(ScriptedProvider::new(rounds));
        let orch = orchestrator(provider, OrchestratorConfig::default()).await;
        let id = orch.sessions().create().await.id;

        let outcome = orch
            .chat(&id, "hi", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.message.content, "Hello there");
        assert_eq!(outcome.rounds, 1);

        let transcript = orch.sessions().transcript(&id).await.unwrap();
        assert_eq!(
            transcript.iter().map(|m| m.role).collect::<Vec<_>>(),
            vec![Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn test_empty_input_rejected_without_touching_transcript() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let orch = orchestrator(provider, OrchestratorConfig::default()).await;
        let id = orch.sessions().create().await.id;

        let err = orch
            .chat(&id, "   ", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(orch.sessions().transcript(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_events_only_when_exposed() {
        let rounds = || {
            vec![
                ScriptedRound::new()
                    .tool_call(ToolCallRequest::new("echo", json!({"text": "ping"})))
                    .done(),
                ScriptedRound::text(&["pong"]),
            ]
        };

        for expose in [false, true] {
            let provider = Arc::new(ScriptedProvider::new(rounds()));
            let config = OrchestratorConfig {
                expose_tool_events: expose,
                ..OrchestratorConfig::default()
            };
            let orch = orchestrator(provider, config).await;
            let id = orch.sessions().create().await.id;

            let (tx, mut rx) = mpsc::channel(32);
            orch.chat(&id, "echo ping", Some(tx), CancellationToken::new())
                .await
                .unwrap();

            let mut kinds = Vec::new();
            while let Ok(event) = rx.try_recv() {
                kinds.push(match event {
                    ChatEvent::Chunk { .. } => "chunk",
                    ChatEvent::ToolCall { .. } => "tool_call",
                    ChatEvent::ToolResult { .. } => "tool_result",
                    ChatEvent::Done { .. } => "done",
                    ChatEvent::Failed { .. } => "failed",
                });
            }
            if expose {
                assert_eq!(kinds, vec!["tool_call", "tool_result", "chunk", "done"]);
            } else {
                assert_eq!(kinds, vec!["chunk", "done"]);
            }
        }
    }

    #[tokio::test]
    async fn test_reused_call_id_gets_fresh_id() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedRound::new()
                .tool_call(ToolCallRequest::with_id("call_0", "echo", json!({"text": "a"})))
                .tool_call(ToolCallRequest::with_id("call_0", "echo", json!({"text": "b"})))
                .done(),
            ScriptedRound::text(&["done"]),
        ]));
        let orch = orchestrator(provider, OrchestratorConfig::default()).await;
        let id = orch.sessions().create().await.id;

        let outcome = orch
            .chat(&id, "twice", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.tool_results.len(), 2);
        assert!(outcome.tool_results.iter().all(|r| r.success));
        assert_ne!(outcome.tool_calls[0].id, outcome.tool_calls[1].id);
    }

    #[tokio::test]
    async fn test_busy_session_rejected() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let config = OrchestratorConfig {
            busy_policy: BusyPolicy::Reject,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(provider, config).await;
        let id = orch.sessions().create().await.id;

        let _guard = orch.begin(&id).await.unwrap();
        let err = orch
            .chat(&id, "hi", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_busy");
    }

    #[tokio::test]
    async fn test_upstream_failure_emits_failed_event() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedRound::fail_open(
            chatgate_llm::ScriptedFailure::Malformed,
        )]));
        let orch = orchestrator(provider, OrchestratorConfig::default()).await;
        let id = orch.sessions().create().await.id;

        let (tx, mut rx) = mpsc::channel(8);
        let err = orch
            .chat(&id, "hi", Some(tx), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_output");

        match rx.recv().await.unwrap() {
            ChatEvent::Failed { kind, .. } => assert_eq!(kind, "malformed_output"),
            other => panic!("unexpected event {:?}", other),
        }
        // The user message stays; nothing else was appended
        assert_eq!(orch.sessions().transcript(&id).await.unwrap().len(), 1);
    }
}
