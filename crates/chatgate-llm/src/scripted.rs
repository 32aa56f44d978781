//! Scripted provider
//!
//! Replays pre-recorded rounds instead of calling an upstream API. Each call to
//! `open_stream` consumes the next round. Used by tests across the workspace
//! and handy for running the gateway without credentials.

use async_stream::stream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatgate_core::{Error, Result, ToolCallRequest};

use crate::provider::{EventStream, LlmProvider, ModelEvent, ModelRequest, ProviderType};

/// Failure injected into a scripted round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    Timeout,
    RateLimited { retry_after_ms: Option<u64> },
    Unavailable,
    Malformed,
}

impl ScriptedFailure {
    fn to_error(&self) -> Error {
        match self {
            ScriptedFailure::Timeout => Error::upstream_timeout("scripted timeout"),
            ScriptedFailure::RateLimited { retry_after_ms } => {
                Error::rate_limited("scripted rate limit", *retry_after_ms)
            }
            ScriptedFailure::Unavailable => Error::upstream(Some(503), "scripted outage"),
            ScriptedFailure::Malformed => Error::malformed("scripted malformed output"),
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Event(ModelEvent),
    Fail(ScriptedFailure),
    Stall,
}

/// One completion's worth of scripted output
#[derive(Debug, Clone, Default)]
pub struct ScriptedRound {
    open_failure: Option<ScriptedFailure>,
    steps: Vec<Step>,
}

impl ScriptedRound {
    pub fn new() -> Self {
        Self::default()
    }

    /// A round that streams `text` in the given pieces and finishes.
    pub fn text(pieces: &[&str]) -> Self {
        pieces
            .iter()
            .fold(Self::new(), |round, piece| round.chunk(*piece))
            .done()
    }

    /// A round that fails before producing anything.
    pub fn fail_open(failure: ScriptedFailure) -> Self {
        Self {
            open_failure: Some(failure),
            steps: Vec::new(),
        }
    }

    pub fn chunk(mut self, text: impl Into<String>) -> Self {
        self.steps.push(Step::Event(ModelEvent::chunk(text)));
        self
    }

    pub fn tool_call(mut self, call: ToolCallRequest) -> Self {
        self.steps.push(Step::Event(ModelEvent::tool_call(call)));
        self
    }

    pub fn done(mut self) -> Self {
        self.steps.push(Step::Event(ModelEvent::done(Some("stop"))));
        self
    }

    /// Yield an error at this point of the stream.
    pub fn fail(mut self, failure: ScriptedFailure) -> Self {
        self.steps.push(Step::Fail(failure));
        self
    }

    /// Never produce another item (exercises idle timeouts and cancellation).
    pub fn stall(mut self) -> Self {
        self.steps.push(Step::Stall);
        self
    }
}

/// Counts streams that were dropped before being fully consumed
struct ReleaseCounter {
    released: Arc<AtomicUsize>,
}

impl Drop for ReleaseCounter {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provider that replays `ScriptedRound`s in order
pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<ScriptedRound>>,
    requests: Mutex<Vec<ModelRequest>>,
    chunk_delay: Option<Duration>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<ScriptedRound>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
            chunk_delay: None,
            opened: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep before every scripted event.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Append more rounds after construction.
    pub fn push_round(&self, round: ScriptedRound) {
        lock(&self.rounds).push_back(round);
    }

    /// Number of `open_stream` calls so far (including failed opens)
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of opened streams that have been dropped
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Rounds not yet consumed
    pub fn remaining(&self) -> usize {
        lock(&self.rounds).len()
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn open_stream(&self, request: &ModelRequest) -> Result<EventStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());

        let round = lock(&self.rounds)
            .pop_front()
            .ok_or_else(|| Error::internal("scripted provider has no rounds left"))?;

        if let Some(failure) = round.open_failure {
            return Err(failure.to_error());
        }

        let counter = ReleaseCounter {
            released: Arc::clone(&self.released),
        };
        let delay = self.chunk_delay;

        Ok(Box::pin(stream! {
            let _counter = counter;
            for step in round.steps {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    Step::Event(event) => yield Ok(event),
                    Step::Fail(failure) => {
                        yield Err(failure.to_error());
                        return;
                    }
                    Step::Stall => std::future::pending::<()>().await,
                }
            }
        }))
    }
}
