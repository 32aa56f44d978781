//! chatgate-tools: Tool Registry and Dispatch
//!
//! Provides the `Tool` capability trait, the registry tools are installed into
//! at startup, the dispatcher that turns model tool calls into results, the
//! built-in tools and an HTTP router for inspecting the catalogue.

pub mod builtin;
pub mod dispatcher;
pub mod registry;
pub mod router;
pub mod tool;

// Re-export main types
pub use dispatcher::{DispatcherConfig, ToolDispatcher};
pub use registry::{RegistryStats, ToolRegistry};
pub use router::{create_router, ToolsState};
pub use tool::{BoxedTool, SimpleTool, Tool};

/// Register all built-in tools
pub async fn register_builtin_tools(registry: &ToolRegistry) -> anyhow::Result<()> {
    builtin::register_all(registry).await
}
