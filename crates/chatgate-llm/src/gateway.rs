//! Model Gateway
//!
//! Wraps a provider with retry, backoff, idle timeouts and cancellation, and
//! hands callers a pull-based `ModelStream`.
//!
//! A pump task drives the provider and forwards events through a bounded
//! channel. Retries happen only while nothing from the current attempt has
//! reached the caller; once output has been forwarded, a failure ends the
//! stream so no chunk is ever delivered twice. Dropping the `ModelStream`
//! cancels the pump, which drops the provider stream and with it the
//! upstream HTTP response.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use chatgate_core::config::{ModelSettings, RetrySettings};
use chatgate_core::{Error, Message, Result, ToolDefinition};

use crate::provider::{LlmProvider, ModelEvent, ModelRequest};

/// Gateway behaviour around a provider
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub system_prompt: String,
    pub retry: RetrySettings,
    /// Bound on opening a stream (connect + response headers)
    pub request_timeout: Duration,
    /// Bound on the gap between two consecutive events
    pub idle_timeout: Duration,
    /// Events buffered between pump and consumer
    pub channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            system_prompt: chatgate_core::config::DEFAULT_SYSTEM_PROMPT.to_string(),
            retry: RetrySettings::default(),
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

impl From<&ModelSettings> for GatewayConfig {
    fn from(settings: &ModelSettings) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            retry: settings.retry.clone(),
            request_timeout: settings.request_timeout,
            idle_timeout: settings.idle_timeout,
            ..Self::default()
        }
    }
}

/// Entry point for streaming completions
#[derive(Clone)]
pub struct ModelGateway {
    provider: Arc<dyn LlmProvider>,
    config: GatewayConfig,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, config: GatewayConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Start a completion over `transcript` with `tools` available.
    ///
    /// The returned stream is lazy only in the sense that events arrive as the
    /// upstream produces them; it is finite and cannot be restarted. Errors are
    /// delivered as the final item.
    pub fn stream(&self, transcript: &[Message], tools: &[ToolDefinition]) -> ModelStream {
        let request = ModelRequest {
            system: self.config.system_prompt.clone(),
            messages: transcript.to_vec(),
            tools: tools.to_vec(),
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let pump = Pump {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
            request,
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(pump.run());

        ModelStream {
            rx,
            _guard: cancel.drop_guard(),
        }
    }
}

/// Pull-based view of one completion.
///
/// Dropping it cancels the upstream request.
pub struct ModelStream {
    rx: mpsc::Receiver<Result<ModelEvent>>,
    _guard: DropGuard,
}

impl ModelStream {
    /// Next event, or `None` once the completion (or its error) has been delivered.
    pub async fn next(&mut self) -> Option<Result<ModelEvent>> {
        self.rx.recv().await
    }
}

impl Stream for ModelStream {
    type Item = Result<ModelEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Outcome of one provider attempt
enum Attempt {
    /// Terminal event delivered, or consumer went away
    Finished,
    Failed { error: Error, delivered: bool },
}

struct Pump {
    provider: Arc<dyn LlmProvider>,
    config: GatewayConfig,
    request: ModelRequest,
    tx: mpsc::Sender<Result<ModelEvent>>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Model stream cancelled by consumer");
            }
            _ = self.drive() => {}
        }
    }

    async fn drive(&self) {
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            let (error, delivered) = match self.attempt().await {
                Attempt::Finished => return,
                Attempt::Failed { error, delivered } => (error, delivered),
            };

            let retryable = !delivered && error.is_retryable() && attempt < retry.max_retries;
            if !retryable {
                if delivered && error.is_retryable() {
                    warn!("Upstream failed after output began, not retrying: {}", error);
                }
                let _ = self.tx.send(Err(error)).await;
                return;
            }

            let delay = retry
                .backoff(attempt)
                .max(Duration::from_millis(error.retry_after_ms().unwrap_or(0)));
            attempt += 1;
            warn!(
                "Upstream {} ({}), retrying in {}ms (attempt {}/{})",
                error.kind(),
                error,
                delay.as_millis(),
                attempt,
                retry.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self) -> Attempt {
        let opened = timeout(self.config.request_timeout, self.provider.open_stream(&self.request)).await;
        let mut events = match opened {
            Err(_) => {
                return Attempt::Failed {
                    error: Error::upstream_timeout(format!(
                        "no response within {}s",
                        self.config.request_timeout.as_secs()
                    )),
                    delivered: false,
                }
            }
            Ok(Err(error)) => return Attempt::Failed { error, delivered: false },
            Ok(Ok(events)) => events,
        };

        info!(
            "Streaming from {} model '{}'",
            self.provider.provider_type(),
            self.provider.model()
        );

        let mut delivered = false;
        loop {
            let next = match timeout(self.config.idle_timeout, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Attempt::Failed {
                        error: Error::upstream_timeout(format!(
                            "no output for {}s",
                            self.config.idle_timeout.as_secs()
                        )),
                        delivered,
                    }
                }
            };

            match next {
                Some(Ok(event)) => {
                    let terminal = matches!(event, ModelEvent::Done { .. });
                    if self.tx.send(Ok(event)).await.is_err() {
                        return Attempt::Finished;
                    }
                    delivered = true;
                    if terminal {
                        return Attempt::Finished;
                    }
                }
                Some(Err(error)) => return Attempt::Failed { error, delivered },
                None => {
                    return Attempt::Failed {
                        error: Error::upstream(None, "upstream closed the stream before completion"),
                        delivered,
                    }
                }
            }
        }
    }
}
