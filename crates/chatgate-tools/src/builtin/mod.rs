//! Built-in Tools
//!
//! - **Math**: `add`, `multiply`
//! - **Utility**: `echo`, `current_time`

mod math;
mod utility;

pub use math::{AddTool, MultiplyTool};
pub use utility::{CurrentTimeTool, EchoTool};

use crate::ToolRegistry;
use std::sync::Arc;
use tracing::info;

/// Register every built-in tool with the registry
pub async fn register_all(registry: &ToolRegistry) -> anyhow::Result<()> {
    registry.register_tool(Arc::new(AddTool)).await?;
    registry.register_tool(Arc::new(MultiplyTool)).await?;
    registry.register_tool(Arc::new(EchoTool)).await?;
    registry.register_tool(Arc::new(CurrentTimeTool)).await?;

    info!("Registered {} built-in tools", registry.len().await);
    Ok(())
}
