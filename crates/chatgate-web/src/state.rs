//! Application State
//!
//! Everything a handler needs, built once at startup from `Settings`.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use chatgate_chat::{ChatOrchestrator, OrchestratorConfig, SessionRegistry};
use chatgate_core::Settings;
use chatgate_llm::{GatewayConfig, LlmProvider, ModelGateway};
use chatgate_tools::{DispatcherConfig, ToolDispatcher, ToolRegistry};

/// Application state shared across all handlers
pub struct AppState {
    pub orchestrator: ChatOrchestrator,
    pub sessions: Arc<SessionRegistry>,
    pub tool_registry: Arc<ToolRegistry>,
    /// Provider name
    pub provider_name: String,
    pub model: String,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Build state with the provider selected by `settings`.
    pub async fn new(settings: &Settings) -> anyhow::Result<Self> {
        let provider = chatgate_llm::create_provider(&settings.model)?;
        Self::with_provider(settings, provider).await
    }

    /// Build state around an explicit provider.
    pub async fn with_provider(
        settings: &Settings,
        provider: Arc<dyn LlmProvider>,
    ) -> anyhow::Result<Self> {
        let tool_registry = Arc::new(ToolRegistry::new());
        chatgate_tools::register_builtin_tools(&tool_registry).await?;
        info!("Registered {} tools", tool_registry.len().await);

        let dispatcher = ToolDispatcher::new(
            Arc::clone(&tool_registry),
            DispatcherConfig::from(&settings.tools),
        );

        let provider_name = provider.provider_type().to_string();
        let model = provider.model().to_string();
        let gateway = ModelGateway::new(provider, GatewayConfig::from(&settings.model));

        let sessions = Arc::new(SessionRegistry::with_max_sessions(settings.sessions.max_sessions));
        let orchestrator = ChatOrchestrator::new(
            Arc::clone(&sessions),
            gateway,
            dispatcher,
            OrchestratorConfig::from(settings),
        );

        Ok(Self {
            orchestrator,
            sessions,
            tool_registry,
            provider_name,
            model,
            start_time: Instant::now(),
        })
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
