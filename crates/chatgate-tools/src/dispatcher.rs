//! Tool dispatcher with timeout and concurrency control
//!
//! Turns a model-issued `ToolCallRequest` into a `ToolCallResult`. Every
//! failure mode (unknown tool, bad arguments, timeout, capability error) comes
//! back as a failure result, never as an `Err`, so a round can continue.
//! Each call id is executed at most once per scope (a session) and never
//! retried. Providers number calls per conversation, so ids only identify a
//! request within its own scope.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use chatgate_core::config::ToolSettings;
use chatgate_core::{ToolCallRequest, ToolCallResult, ToolFailure};

use crate::ToolRegistry;

/// Configuration for tool dispatch
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent tool executions
    pub max_concurrent: usize,
    /// Default timeout for a call
    pub default_timeout: Duration,
    /// Upper bound applied to per-tool overrides
    pub max_timeout: Duration,
    /// How many recent (scope, call id) pairs are remembered for duplicate detection
    pub dedup_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            dedup_capacity: 4096,
        }
    }
}

impl From<&ToolSettings> for DispatcherConfig {
    fn from(settings: &ToolSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent.max(1),
            default_timeout: settings.default_timeout,
            max_timeout: settings.max_timeout,
            ..Self::default()
        }
    }
}

type CallKey = (String, String);

/// Bounded record of call ids already dispatched, per scope
struct CallLedger {
    seen: HashSet<CallKey>,
    order: VecDeque<CallKey>,
    capacity: usize,
}

impl CallLedger {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already claimed within `scope`.
    fn claim(&mut self, scope: &str, id: &str) -> bool {
        let key = (scope.to_string(), id.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Resolves tool calls against the registry and runs them
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
    ledger: Arc<Mutex<CallLedger>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let ledger = Arc::new(Mutex::new(CallLedger::new(config.dedup_capacity)));
        Self {
            registry,
            config,
            semaphore,
            ledger,
        }
    }

    pub fn with_defaults(registry: Arc<ToolRegistry>) -> Self {
        Self::new(registry, DispatcherConfig::default())
    }

    /// Invoke the tool named by `request` outside any session.
    pub async fn invoke(&self, request: &ToolCallRequest) -> ToolCallResult {
        self.invoke_scoped("", request).await
    }

    /// Invoke the tool named by `request` on behalf of `scope`.
    ///
    /// Duplicate detection only looks at ids previously seen in the same scope.
    pub async fn invoke_scoped(&self, scope: &str, request: &ToolCallRequest) -> ToolCallResult {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        if !self.claim(scope, &request.id) {
            warn!(scope = %scope, "Refusing duplicate tool call id '{}'", request.id);
            return ToolCallResult::failure(
                &request.id,
                ToolFailure::DuplicateCall,
                format!("tool call '{}' was already executed", request.id),
                elapsed(start),
            );
        }

        let Some(tool) = self.registry.get(&request.name).await else {
            warn!("Model requested unknown tool '{}'", request.name);
            return ToolCallResult::failure(
                &request.id,
                ToolFailure::UnknownTool,
                format!("no tool named '{}'", request.name),
                elapsed(start),
            );
        };

        let arguments = match &request.arguments {
            serde_json::Value::Null => serde_json::json!({}),
            serde_json::Value::Object(_) => request.arguments.clone(),
            other => {
                return ToolCallResult::failure(
                    &request.id,
                    ToolFailure::InvalidArguments,
                    format!("arguments must be a JSON object, got {}", other),
                    elapsed(start),
                );
            }
        };

        let limit = tool
            .timeout()
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout);

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ToolCallResult::failure(
                    &request.id,
                    ToolFailure::ToolError,
                    "dispatcher shut down",
                    elapsed(start),
                );
            }
        };

        debug!(
            tool = %request.name,
            call_id = %request.id,
            "Dispatching tool call with timeout {}ms",
            limit.as_millis()
        );

        match timeout(limit, tool.execute(arguments)).await {
            Ok(Ok(content)) => {
                debug!(
                    "Tool '{}' completed in {}ms",
                    request.name,
                    start.elapsed().as_millis()
                );
                ToolCallResult::success(&request.id, content, elapsed(start))
            }
            Ok(Err(e)) => {
                warn!("Tool '{}' failed: {:#}", request.name, e);
                ToolCallResult::failure(
                    &request.id,
                    ToolFailure::ToolError,
                    format!("{:#}", e),
                    elapsed(start),
                )
            }
            Err(_) => {
                warn!(
                    "Tool '{}' timed out after {}ms",
                    request.name,
                    limit.as_millis()
                );
                ToolCallResult::failure(
                    &request.id,
                    ToolFailure::Timeout,
                    format!("tool execution timed out after {}ms", limit.as_millis()),
                    elapsed(start),
                )
            }
        }
    }

    fn claim(&self, scope: &str, id: &str) -> bool {
        match self.ledger.lock() {
            Ok(mut ledger) => ledger.claim(scope, id),
            Err(poisoned) => poisoned.into_inner().claim(scope, id),
        }
    }

    /// Get current concurrency usage
    pub fn current_usage(&self) -> usize {
        self.config.max_concurrent.max(1) - self.semaphore.available_permits()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

impl Clone for ToolDispatcher {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            semaphore: Arc::clone(&self.semaphore),
            ledger: Arc::clone(&self.ledger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{SimpleTool, Tool};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps for a minute"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("done"))
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }
    }

    async fn dispatcher_with(tools: Vec<crate::BoxedTool>) -> ToolDispatcher {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry.register_tool(tool).await.unwrap();
        }
        ToolDispatcher::with_defaults(registry)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_failure_result() {
        let dispatcher = dispatcher_with(vec![]).await;
        let result = dispatcher
            .invoke(&ToolCallRequest::new("nope", json!({})))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(ToolFailure::UnknownTool));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failure_result() {
        let dispatcher = dispatcher_with(vec![Arc::new(SlowTool)]).await;
        let result = dispatcher
            .invoke(&ToolCallRequest::new("slow", json!({})))
            .await;
        assert_eq!(result.failure, Some(ToolFailure::Timeout));
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_tool_error_is_reported() {
        let failing = SimpleTool::new("boom", "always fails", json!({}), |_| {
            Err(anyhow!("disk on fire"))
        });
        let dispatcher = dispatcher_with(vec![Arc::new(failing)]).await;
        let result = dispatcher
            .invoke(&ToolCallRequest::new("boom", json!({})))
            .await;
        assert_eq!(result.failure, Some(ToolFailure::ToolError));
        assert_eq!(result.error.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn test_non_object_arguments_rejected() {
        let dispatcher = dispatcher_with(vec![Arc::new(SimpleTool::new(
            "echo",
            "echo",
            json!({}),
            Ok,
        ))])
        .await;
        let result = dispatcher
            .invoke(&ToolCallRequest::new("echo", json!([1, 2])))
            .await;
        assert_eq!(result.failure, Some(ToolFailure::InvalidArguments));
    }

    #[tokio::test]
    async fn test_same_call_id_runs_at_most_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let tool = SimpleTool::new("count", "counts", json!({}), move |_| {
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let dispatcher = dispatcher_with(vec![Arc::new(tool)]).await;

        let request = ToolCallRequest::with_id("call_fixed", "count", json!({}));
        let first = dispatcher.invoke(&request).await;
        let second = dispatcher.clone().invoke(&request).await;

        assert!(first.success);
        assert_eq!(second.failure, Some(ToolFailure::DuplicateCall));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_call_id_runs_once_per_scope() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let tool = SimpleTool::new("count", "counts", json!({}), move |_| {
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let dispatcher = dispatcher_with(vec![Arc::new(tool)]).await;

        let request = ToolCallRequest::with_id("call_0", "count", json!({}));
        let in_a = dispatcher.invoke_scoped("session-a", &request).await;
        let in_b = dispatcher.invoke_scoped("session-b", &request).await;
        let again_in_a = dispatcher.invoke_scoped("session-a", &request).await;

        assert!(in_a.success);
        assert!(in_b.success);
        assert_eq!(again_in_a.failure, Some(ToolFailure::DuplicateCall));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ledger_forgets_oldest_beyond_capacity() {
        let mut ledger = CallLedger::new(2);
        assert!(ledger.claim("s", "a"));
        assert!(ledger.claim("s", "b"));
        assert!(!ledger.claim("s", "a"));
        assert!(ledger.claim("s", "c"));
        assert!(ledger.claim("s", "a"));
        assert!(ledger.claim("t", "a"));
    }
}
