//! chatgate-llm: Model Gateway
//!
//! Opens a streaming completion against the configured upstream model and
//! exposes it as a pull-based sequence of `ModelEvent`s (text chunks, tool
//! calls, a terminal marker).
//!
//! - `provider`: the `LlmProvider` trait and the provider factory
//! - `anthropic` / `openai`: streaming HTTP providers
//! - `sse`: server-sent-event decoding shared by both providers
//! - `gateway`: retry, backoff, idle timeout and cancellation around a provider
//! - `scripted`: deterministic in-process provider for tests and local runs

pub mod anthropic;
pub mod gateway;
pub mod http;
pub mod openai;
pub mod provider;
pub mod scripted;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use gateway::{GatewayConfig, ModelGateway, ModelStream};
pub use openai::OpenAiProvider;
pub use provider::{create_provider, EventStream, LlmProvider, ModelEvent, ModelRequest, ProviderType};
pub use scripted::{ScriptedFailure, ScriptedProvider, ScriptedRound};
