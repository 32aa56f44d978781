//! Common types used across chatgate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A model's request to invoke a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-issued call id, or a generated one when the provider omits it
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Id of the transcript message that carries this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self::with_id(format!("call_{}", Uuid::new_v4().simple()), name, arguments)
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            message_id: None,
        }
    }
}

/// Why a tool call did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    UnknownTool,
    InvalidArguments,
    Timeout,
    ToolError,
    DuplicateCall,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFailure::UnknownTool => write!(f, "unknown tool"),
            ToolFailure::InvalidArguments => write!(f, "invalid arguments"),
            ToolFailure::Timeout => write!(f, "timeout"),
            ToolFailure::ToolError => write!(f, "tool error"),
            ToolFailure::DuplicateCall => write!(f, "duplicate call"),
        }
    }
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub success: bool,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    pub fn success(call_id: impl Into<String>, content: Value, exec_time: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            content,
            error: None,
            failure: None,
            execution_time_ms: exec_time,
        }
    }

    pub fn failure(
        call_id: impl Into<String>,
        failure: ToolFailure,
        error: impl Into<String>,
        exec_time: u64,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            content: Value::Null,
            error: Some(error.into()),
            failure: Some(failure),
            execution_time_ms: exec_time,
        }
    }

    /// Text form fed back to the model and stored as the tool message content.
    pub fn render(&self) -> String {
        if self.success {
            match &self.content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else {
            format!(
                "Error ({}): {}",
                self.failure.unwrap_or(ToolFailure::ToolError),
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// One immutable entry of a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolCallResult>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_call: None,
            tool_result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// A tool message carries both the request it resolves and its result.
    pub fn tool(mut request: ToolCallRequest, result: ToolCallResult) -> Self {
        let mut message = Self::new(Role::Tool, result.render());
        request.message_id = Some(message.id.clone());
        message.tool_call = Some(request);
        message.tool_result = Some(result);
        message
    }
}
