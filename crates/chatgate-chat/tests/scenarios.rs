//! End-to-end exchanges against a scripted model

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chatgate_chat::{ChatEvent, ChatOrchestrator, OrchestratorConfig, SessionRegistry};
use chatgate_core::{Role, ToolCallRequest, ToolFailure};
use chatgate_llm::{GatewayConfig, ModelGateway, ScriptedProvider, ScriptedRound};
use chatgate_tools::{ToolDispatcher, ToolRegistry};

async fn setup(provider: Arc<ScriptedProvider>, config: OrchestratorConfig) -> ChatOrchestrator {
    let registry = Arc::new(ToolRegistry::new());
    chatgate_tools::register_builtin_tools(&registry).await.unwrap();
    ChatOrchestrator::new(
        Arc::new(SessionRegistry::new()),
        ModelGateway::new(provider, GatewayConfig::default()),
        ToolDispatcher::with_defaults(registry),
        config,
    )
}

fn five_chunks() -> ScriptedRound {
    ScriptedRound::new()
        .chunk("one ")
        .chunk("two ")
        .chunk("three ")
        .chunk("four ")
        .chunk("five")
        .done()
}

#[tokio::test]
async fn add_tool_round_trip() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedRound::new()
            .tool_call(ToolCallRequest::with_id("call_add", "add", json!({"a": 2, "b": 3})))
            .done(),
        ScriptedRound::text(&["The result", " is 5."]),
    ]));
    let orch = setup(Arc::clone(&provider), OrchestratorConfig::default()).await;
    let id = orch.sessions().create().await.id;

    let (tx, mut rx) = mpsc::channel(32);
    let outcome = orch
        .chat(&id, "What is 2+3?", Some(tx), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.message.content, "The result is 5.");
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.tool_results.len(), 1);
    assert_eq!(outcome.tool_results[0].content, json!(5));

    let transcript = orch.sessions().transcript(&id).await.unwrap();
    let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Tool, Role::Assistant]);
    assert_eq!(transcript[1].content, "5");

    // Second model request saw the tool result
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 2);
    assert_eq!(requests[1].tools.len(), 4);

    let mut chunks = String::new();
    let mut done = false;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Chunk { text } => chunks.push_str(&text),
            ChatEvent::Done { message } => {
                assert_eq!(message.content, "The result is 5.");
                done = true;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(done);
    assert_eq!(chunks, "The result is 5.");
}

#[tokio::test]
async fn unknown_tool_fed_back_to_model() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedRound::new()
            .tool_call(ToolCallRequest::with_id("call_x", "teleport", json!({})))
            .done(),
        ScriptedRound::text(&["I can't do that."]),
    ]));
    let orch = setup(Arc::clone(&provider), OrchestratorConfig::default()).await;
    let id = orch.sessions().create().await.id;

    let outcome = orch
        .chat(&id, "teleport me", None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.message.content, "I can't do that.");
    assert!(!outcome.tool_results[0].success);
    assert_eq!(outcome.tool_results[0].failure, Some(ToolFailure::UnknownTool));

    let transcript = orch.sessions().transcript(&id).await.unwrap();
    assert_eq!(transcript[1].role, Role::Tool);
    assert!(transcript[1].content.starts_with("Error (unknown tool)"));
}

#[tokio::test]
async fn invalid_arguments_fed_back_to_model() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedRound::new()
            .tool_call(ToolCallRequest::with_id("call_bad", "add", json!("2 and 3")))
            .done(),
        ScriptedRound::text(&["Let me retry."]),
    ]));
    let orch = setup(provider, OrchestratorConfig::default()).await;
    let id = orch.sessions().create().await.id;

    let outcome = orch.chat(&id, "add", None, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.tool_results[0].failure, Some(ToolFailure::InvalidArguments));
}

#[tokio::test]
async fn loop_limit_bounds_tool_rounds() {
    let looping = || {
        ScriptedRound::new()
            .tool_call(ToolCallRequest::new("echo", json!({"text": "again"})))
            .done()
    };
    let provider = Arc::new(ScriptedProvider::new(vec![looping(), looping(), looping(), looping()]));
    let config = OrchestratorConfig {
        max_tool_rounds: 2,
        ..OrchestratorConfig::default()
    };
    let orch = setup(Arc::clone(&provider), config).await;
    let id = orch.sessions().create().await.id;

    let (tx, mut rx) = mpsc::channel(32);
    let err = orch
        .chat(&id, "loop forever", Some(tx), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "loop_limit");
    assert_eq!(provider.opened(), 3);
    assert_eq!(provider.remaining(), 1);

    match rx.recv().await.unwrap() {
        ChatEvent::Failed { kind, .. } => assert_eq!(kind, "loop_limit"),
        other => panic!("unexpected event {:?}", other),
    }

    let transcript = orch.sessions().transcript(&id).await.unwrap();
    assert_eq!(transcript.len(), 3);
    assert!(transcript.iter().all(|m| m.role != Role::Assistant));
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_stream_discards_partial_reply() {
    let provider = Arc::new(ScriptedProvider::new(vec![five_chunks()]).with_chunk_delay(Duration::from_millis(10)));
    let orch = setup(Arc::clone(&provider), OrchestratorConfig::default()).await;
    let id = orch.sessions().create().await.id;

    let (tx, mut rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let task = {
        let orch = orch.clone();
        let id = id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.chat(&id, "count to five", Some(tx), cancel).await })
    };

    for _ in 0..2 {
        assert!(matches!(rx.recv().await, Some(ChatEvent::Chunk { .. })));
    }
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "cancelled");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.released(), 1);

    let transcript = orch.sessions().transcript(&id).await.unwrap();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].role, Role::User);

    // The session accepts a new exchange afterwards
    assert!(orch.begin(&id).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_cancels_exchange() {
    let provider = Arc::new(ScriptedProvider::new(vec![five_chunks()]).with_chunk_delay(Duration::from_millis(10)));
    let orch = setup(Arc::clone(&provider), OrchestratorConfig::default()).await;
    let id = orch.sessions().create().await.id;

    let (tx, mut rx) = mpsc::channel(1);
    let task = {
        let orch = orch.clone();
        let id = id.clone();
        tokio::spawn(async move { orch.chat(&id, "count to five", Some(tx), CancellationToken::new()).await })
    };

    for _ in 0..2 {
        assert!(matches!(rx.recv().await, Some(ChatEvent::Chunk { .. })));
    }
    drop(rx);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "cancelled");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.released(), 1);
    assert_eq!(orch.sessions().transcript(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sessions_are_isolated() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedRound::text(&["first"]),
        ScriptedRound::text(&["second"]),
    ]));
    let orch = setup(Arc::clone(&provider), OrchestratorConfig::default()).await;
    let a = orch.sessions().create().await.id;
    let b = orch.sessions().create().await.id;

    orch.chat(&a, "to a", None, CancellationToken::new()).await.unwrap();
    orch.chat(&b, "to b", None, CancellationToken::new()).await.unwrap();

    // Each request carries only its own session's history
    let requests = provider.requests();
    assert_eq!(requests[1].messages.len(), 1);
    assert_eq!(requests[1].messages[0].content, "to b");
    assert_eq!(orch.sessions().transcript(&a).await.unwrap().len(), 2);
}

#[tokio::test]
async fn provider_call_ids_are_per_session() {
    // Each session's model numbers its calls from call_0
    let add_call = || {
        ScriptedRound::new()
            .tool_call(ToolCallRequest::with_id("call_0", "add", json!({"a": 2, "b": 3})))
            .done()
    };
    let provider = Arc::new(ScriptedProvider::new(vec![
        add_call(),
        ScriptedRound::text(&["The result is 5."]),
        add_call(),
        ScriptedRound::text(&["The result is 5."]),
    ]));
    let orch = setup(Arc::clone(&provider), OrchestratorConfig::default()).await;
    let a = orch.sessions().create().await.id;
    let b = orch.sessions().create().await.id;

    for id in [&a, &b] {
        let outcome = orch
            .chat(id, "What is 2+3?", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.tool_calls[0].id, "call_0");
        assert!(outcome.tool_results[0].success);
        assert_eq!(outcome.tool_results[0].failure, None);
        assert_eq!(outcome.tool_results[0].content, json!(5));
        assert_eq!(outcome.message.content, "The result is 5.");
    }
    assert_eq!(provider.requests().len(), 4);
}
