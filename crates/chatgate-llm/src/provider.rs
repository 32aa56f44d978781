//! LLM Provider Trait and Types
//!
//! Every provider turns a `ModelRequest` into a finite stream of
//! `ModelEvent`s. Providers do not retry; the gateway does.

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

use chatgate_core::config::ModelSettings;
use chatgate_core::{Message, Result, ToolCallRequest, ToolDefinition};

pub use chatgate_core::ProviderType;

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;

/// One item of a model's streamed output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Fragment of assistant text
    Chunk { text: String },
    /// Fully assembled tool call
    ToolCall { call: ToolCallRequest },
    /// End of this completion
    Done { finish_reason: Option<String> },
}

impl ModelEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        ModelEvent::Chunk { text: text.into() }
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        ModelEvent::ToolCall { call }
    }

    pub fn done(finish_reason: Option<&str>) -> Self {
        ModelEvent::Done {
            finish_reason: finish_reason.map(str::to_string),
        }
    }
}

/// Everything a provider needs for one completion
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Stream of events produced by one provider attempt
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ModelEvent>> + Send>>;

/// LLM Provider trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Model identifier sent upstream
    fn model(&self) -> &str;

    /// Open a streaming completion.
    ///
    /// Errors returned here or yielded by the stream are classified with
    /// `chatgate_core::Error` so the gateway can decide whether to retry.
    async fn open_stream(&self, request: &ModelRequest) -> Result<EventStream>;
}

/// Build the provider selected in the settings
pub fn create_provider(settings: &ModelSettings) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match settings.provider {
        ProviderType::Anthropic => Arc::new(AnthropicProvider::new(settings)?),
        ProviderType::OpenAI => Arc::new(OpenAiProvider::new(settings)?),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(ModelEvent::chunk("hi")).unwrap();
        assert_eq!(value, json!({"type": "chunk", "text": "hi"}));

        let value = serde_json::to_value(ModelEvent::done(Some("end_turn"))).unwrap();
        assert_eq!(value["finish_reason"], "end_turn");
    }
}
