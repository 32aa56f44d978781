//! Core Tool trait and types
//!
//! Defines the interface every tool capability implements.

use anyhow::Result;
use async_trait::async_trait;
use chatgate_core::ToolDefinition;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Core trait for all tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name (unique identifier)
    fn name(&self) -> &str;

    /// Get human-readable description
    fn description(&self) -> &str;

    /// Get JSON schema for the arguments object
    fn input_schema(&self) -> Value;

    /// Execute the tool with given arguments
    async fn execute(&self, input: Value) -> Result<Value>;

    /// Per-tool timeout override; the dispatcher default applies when `None`
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Catalogue entry advertised to the model
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Type alias for boxed tools
pub type BoxedTool = Arc<dyn Tool>;

/// Closure-backed tool
#[derive(Clone)]
pub struct SimpleTool {
    name: String,
    description: String,
    schema: Value,
    handler: Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>,
}

impl SimpleTool {
    pub fn new<F>(name: &str, description: &str, schema: Value, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for SimpleTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        (self.handler)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_tool() {
        let tool = SimpleTool::new(
            "echo",
            "Echo input back",
            serde_json::json!({"type": "object"}),
            |input| Ok(input),
        );

        assert_eq!(tool.name(), "echo");
        let definition = tool.definition();
        assert_eq!(definition.description, "Echo input back");
        assert_eq!(definition.input_schema["type"], "object");

        let result = tool.execute(serde_json::json!({"msg": "hello"})).await.unwrap();
        assert_eq!(result, serde_json::json!({"msg": "hello"}));
    }
}
