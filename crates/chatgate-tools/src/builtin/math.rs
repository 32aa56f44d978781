//! Arithmetic tools

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::Tool;

fn operand(input: &Value, key: &str) -> Result<f64> {
    input
        .get(key)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing numeric argument '{}'", key))
}

/// Whole results come back as integers so the model sees `5`, not `5.0`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn binary_schema(verb: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "a": {"type": "number", "description": format!("First number to {}", verb)},
            "b": {"type": "number", "description": format!("Second number to {}", verb)}
        },
        "required": ["a", "b"]
    })
}

pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers and return the sum"
    }

    fn input_schema(&self) -> Value {
        binary_schema("add")
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        Ok(number(operand(&input, "a")? + operand(&input, "b")?))
    }
}

pub struct MultiplyTool;

#[async_trait]
impl Tool for MultiplyTool {
    fn name(&self) -> &str {
        "multiply"
    }

    fn description(&self) -> &str {
        "Multiply two numbers and return the product"
    }

    fn input_schema(&self) -> Value {
        binary_schema("multiply")
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        Ok(number(operand(&input, "a")? * operand(&input, "b")?))
    }
}
