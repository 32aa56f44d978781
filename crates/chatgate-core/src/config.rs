//! Environment Configuration
//!
//! Two layers:
//!
//! - `load_environment()` copies `KEY=VALUE` lines from an env file into the
//!   process environment without overriding variables that are already set.
//! - `Settings::from_env()` reads the environment once at startup and builds the
//!   typed configuration every other crate receives explicitly.
//!
//! ```rust,no_run
//! use chatgate_core::config::{load_environment, Settings};
//!
//! load_environment();
//! let settings = Settings::from_env().expect("invalid configuration");
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Paths checked for an environment file (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/chatgate/environment", ".env"];

/// Prompt prepended to every model request unless `SYSTEM_PROMPT` is set
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Only use tools if needed for a user query.";

/// Load environment variables from the first env file found.
///
/// `CHATGATE_ENV_FILE` takes precedence over `ENV_FILE_PATHS`. Existing
/// environment variables are never overridden.
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("CHATGATE_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

/// Load a specific env file (used by the `--env-file` flag).
pub fn load_environment_from(path: &str) -> Option<String> {
    try_load_env_file(path)
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded_count = 0;
            let mut skipped_count = 0;

            for line in content.lines() {
                let line = line.trim();

                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                if let Some((key, value)) = parse_env_line(line) {
                    if std::env::var(&key).is_err() {
                        std::env::set_var(&key, &value);
                        loaded_count += 1;
                        debug!("Loaded: {}={}", key, mask_secret(&key, &value));
                    } else {
                        skipped_count += 1;
                        debug!("Skipped (already set): {}", key);
                    }
                }
            }

            info!(
                "Loaded {} environment variables from {} ({} skipped - already set)",
                loaded_count, path, skipped_count
            );

            Some(path.to_string())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            None
        }
    }
}

fn mask_secret<'a>(key: &str, value: &'a str) -> &'a str {
    if key.contains("KEY") || key.contains("TOKEN") || key.contains("SECRET") {
        "***"
    } else {
        value
    }
}

/// Parse a single environment line into key-value pair.
///
/// Handles `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'` and a leading `export `.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Get a configuration value with a default.
pub fn get_config(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get an optional configuration value.
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get a boolean configuration value.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

// =============================================================================
// TYPED SETTINGS
// =============================================================================

/// Upstream model provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    Anthropic,
    OpenAI,
}

impl ProviderType {
    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "ANTHROPIC_API_KEY",
            ProviderType::OpenAI => "OPENAI_API_KEY",
        }
    }

    pub fn base_url_var(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "ANTHROPIC_BASE_URL",
            ProviderType::OpenAI => "OPENAI_BASE_URL",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "https://api.anthropic.com/v1",
            ProviderType::OpenAI => "https://api.openai.com/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "claude-sonnet-4-20250514",
            ProviderType::OpenAI => "gpt-4o",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Anthropic => write!(f, "anthropic"),
            ProviderType::OpenAI => write!(f, "openai"),
        }
    }
}

impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderType::Anthropic),
            "openai" | "open_ai" => Ok(ProviderType::OpenAI),
            other => Err(Error::config(format!("Unknown provider type: {}", other))),
        }
    }
}

/// What to do when a message arrives for a session that already has a round in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Wait for the in-flight round to finish (FIFO)
    Queue,
    /// Fail the new message with `Error::SessionBusy`
    #[default]
    Reject,
}

impl FromStr for BusyPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(BusyPolicy::Queue),
            "reject" => Ok(BusyPolicy::Reject),
            other => Err(Error::config(format!(
                "SESSION_BUSY_POLICY must be 'queue' or 'reject', got '{}'",
                other
            ))),
        }
    }
}

/// Retry policy for upstream model calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8000),
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Upstream model configuration
#[derive(Clone)]
pub struct ModelSettings {
    pub provider: ProviderType,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub retry: RetrySettings,
}

impl fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout", &self.request_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Tool dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(30_000),
            max_timeout: Duration::from_millis(300_000),
            max_concurrent: 16,
        }
    }
}

/// Session registry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub max_sessions: usize,
    pub busy_policy: BusyPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            reap_interval: Duration::from_secs(60),
            max_sessions: 1000,
            busy_policy: BusyPolicy::Reject,
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Separate WebSocket listener; `None` serves `/ws` on the HTTP listener
    pub ws_bind: Option<(String, u16)>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            ws_bind: None,
        }
    }
}

/// Typed gateway configuration, built once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: ModelSettings,
    pub tools: ToolSettings,
    pub sessions: SessionSettings,
    pub server: ServerSettings,
    pub max_tool_rounds: usize,
    pub expose_tool_events: bool,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    ///
    /// A missing credential for the selected provider is an error: the gateway
    /// must not start without one.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let (provider, model) = match var("BASE_MODEL") {
            Some(base) => parse_base_model(&base)?,
            None => {
                let provider = match var("LLM_PROVIDER") {
                    Some(p) => p.parse()?,
                    None => ProviderType::Anthropic,
                };
                let model = var("LLM_MODEL").unwrap_or_else(|| provider.default_model().to_string());
                (provider, model)
            }
        };

        let api_key = var(provider.api_key_var()).ok_or_else(|| {
            Error::config(format!(
                "{} environment variable not set (required for provider '{}')",
                provider.api_key_var(),
                provider
            ))
        })?;

        let base_url = var(provider.base_url_var())
            .unwrap_or_else(|| provider.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let retry = RetrySettings {
            max_retries: parse_var(&var, "LLM_MAX_RETRIES", 3)?,
            backoff_base: Duration::from_millis(parse_var(&var, "LLM_BACKOFF_BASE_MS", 500)?),
            backoff_max: Duration::from_millis(parse_var(&var, "LLM_BACKOFF_MAX_MS", 8000)?),
        };

        let model = ModelSettings {
            provider,
            model,
            api_key,
            base_url,
            system_prompt: var("SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: parse_var(&var, "LLM_MAX_TOKENS", 4096)?,
            request_timeout: Duration::from_secs(parse_var(&var, "LLM_REQUEST_TIMEOUT_SECS", 60)?),
            idle_timeout: Duration::from_secs(parse_var(&var, "LLM_IDLE_TIMEOUT_SECS", 30)?),
            retry,
        };

        let tools = ToolSettings {
            default_timeout: Duration::from_millis(parse_var(&var, "TOOL_TIMEOUT_MS", 30_000)?),
            max_timeout: Duration::from_millis(parse_var(&var, "TOOL_MAX_TIMEOUT_MS", 300_000)?),
            max_concurrent: parse_var(&var, "TOOL_MAX_CONCURRENT", 16)?,
        };

        let sessions = SessionSettings {
            idle_timeout: Duration::from_secs(parse_var(&var, "SESSION_IDLE_TIMEOUT_SECS", 1800)?),
            reap_interval: Duration::from_secs(parse_var(&var, "SESSION_REAP_INTERVAL_SECS", 60)?),
            max_sessions: parse_var(&var, "MAX_SESSIONS", 1000)?,
            busy_policy: match var("SESSION_BUSY_POLICY") {
                Some(p) => p.parse()?,
                None => BusyPolicy::default(),
            },
        };

        let ws_bind = match (var("WS_HOST"), var("WS_PORT")) {
            (None, None) => None,
            (host, _) => Some((
                host.unwrap_or_else(|| "0.0.0.0".to_string()),
                parse_var(&var, "WS_PORT", 8001)?,
            )),
        };

        let server = ServerSettings {
            host: var("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var(&var, "API_PORT", 8000)?,
            ws_bind,
        };

        let max_tool_rounds: usize = parse_var(&var, "MAX_TOOL_ROUNDS", 8)?;
        if max_tool_rounds == 0 {
            return Err(Error::config("MAX_TOOL_ROUNDS must be at least 1"));
        }

        Ok(Self {
            model,
            tools,
            sessions,
            server,
            max_tool_rounds,
            expose_tool_events: var("EXPOSE_TOOL_EVENTS").map(|v| parse_bool(&v)).unwrap_or(false),
        })
    }
}

/// Split `provider:model` (e.g. `openai:gpt-4o`).
fn parse_base_model(base: &str) -> Result<(ProviderType, String)> {
    let (provider, model) = base.split_once(':').ok_or_else(|| {
        Error::config(format!(
            "BASE_MODEL must look like 'provider:model', got '{}'",
            base
        ))
    })?;
    let provider: ProviderType = provider.parse()?;
    let model = model.trim();
    if model.is_empty() {
        return Err(Error::config("BASE_MODEL is missing the model name"));
    }
    Ok((provider, model.to_string()))
}

fn parse_var<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("{} has an invalid value: '{}'", key, raw))),
        None => Ok(default),
    }
}
