//! Tool Registry
//!
//! Tools are registered once at startup and resolved by exact name.
//! Each entry tracks how often it was used.

use anyhow::{bail, Result};
use chatgate_core::ToolDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::tool::BoxedTool;

/// A registered tool with usage tracking
struct RegisteredTool {
    tool: BoxedTool,
    definition: ToolDefinition,
    use_count: AtomicU64,
}

/// Statistics about the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_registered: usize,
    pub total_calls: u64,
    pub misses: u64,
}

/// Name-keyed tool registry
pub struct ToolRegistry {
    tools: RwLock<HashMap<Arc<str>, Arc<RegisteredTool>>>,
    misses: AtomicU64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            misses: AtomicU64::new(0),
        }
    }

    /// Register a tool. Names are unique; a second registration is an error.
    pub async fn register_tool(&self, tool: BoxedTool) -> Result<()> {
        let definition = tool.definition();
        let name: Arc<str> = Arc::from(definition.name.as_str());

        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            bail!("Tool '{}' is already registered", name);
        }

        debug!("Registering tool: {}", name);
        tools.insert(
            name,
            Arc::new(RegisteredTool {
                tool,
                definition,
                use_count: AtomicU64::new(0),
            }),
        );
        info!("Tool registry now holds {} tools", tools.len());
        Ok(())
    }

    /// Resolve a tool by exact name
    pub async fn get(&self, name: &str) -> Option<BoxedTool> {
        let tools = self.tools.read().await;
        match tools.get(name) {
            Some(entry) => {
                entry.use_count.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.tool))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Definition of a single tool without touching its usage counter
    pub async fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().await.get(name).map(|e| e.definition.clone())
    }

    /// Catalogue handed to the model, sorted by name for stable prompts
    pub async fn list(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut definitions: Vec<ToolDefinition> =
            tools.values().map(|e| e.definition.clone()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    pub async fn stats(&self) -> RegistryStats {
        let tools = self.tools.read().await;
        RegistryStats {
            total_registered: tools.len(),
            total_calls: tools
                .values()
                .map(|e| e.use_count.load(Ordering::Relaxed))
                .sum(),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::SimpleTool;
    use serde_json::json;

    fn echo(name: &str) -> BoxedTool {
        Arc::new(SimpleTool::new(name, "test tool", json!({"type": "object"}), Ok))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register_tool(echo("beta")).await.unwrap();
        registry.register_tool(echo("alpha")).await.unwrap();

        assert!(registry.get("alpha").await.is_some());
        assert!(registry.get("Alpha").await.is_none());

        let names: Vec<_> = registry.list().await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = ToolRegistry::new();
        registry.register_tool(echo("dup")).await.unwrap();
        assert!(registry.register_tool(echo("dup")).await.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stats_count_hits_and_misses() {
        let registry = ToolRegistry::new();
        registry.register_tool(echo("one")).await.unwrap();
        registry.get("one").await;
        registry.get("one").await;
        registry.get("missing").await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_registered, 1);
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.misses, 1);
    }
}
