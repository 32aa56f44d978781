//! Types and data structures for chat orchestration

use serde::Serialize;

use chatgate_core::config::Settings;
use chatgate_core::{BusyPolicy, Error, Message, ToolCallRequest, ToolCallResult};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tool round-trips allowed per exchange before failing
    pub max_tool_rounds: usize,
    /// Emit `ToolCall`/`ToolResult` events to the client
    pub expose_tool_events: bool,
    pub busy_policy: BusyPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            expose_tool_events: false,
            busy_policy: BusyPolicy::Reject,
        }
    }
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_tool_rounds: settings.max_tool_rounds,
            expose_tool_events: settings.expose_tool_events,
            busy_policy: settings.sessions.busy_policy,
        }
    }
}

/// Where an exchange currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    AwaitingModel,
    Streaming,
    DispatchingTool,
    Complete,
    Failed,
}

/// Events streamed to the transport during an exchange
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Partial assistant text
    Chunk { text: String },
    /// Model requested a tool (debug visibility only)
    ToolCall { call: ToolCallRequest },
    /// Tool finished (debug visibility only)
    ToolResult { result: ToolCallResult },
    /// Exchange complete; carries the final assistant message
    Done { message: Message },
    /// Exchange failed
    Failed { kind: String, message: String },
}

impl ChatEvent {
    pub fn failed(error: &Error) -> Self {
        ChatEvent::Failed {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Failed { .. })
    }
}

/// Result of a completed exchange
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeOutcome {
    pub session_id: String,
    pub message: Message,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_results: Vec<ToolCallResult>,
    /// Model invocations made during the exchange
    pub rounds: usize,
}
