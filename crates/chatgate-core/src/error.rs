//! Error types for chatgate

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("tool-call loop limit exceeded after {0} rounds")]
    LoopLimit(usize),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    #[error("Upstream error: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("Exchange cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Error::SessionNotFound(id.into())
    }

    pub fn session_busy(id: impl Into<String>) -> Self {
        Error::SessionBusy(id.into())
    }

    pub fn upstream_timeout(msg: impl Into<String>) -> Self {
        Error::UpstreamTimeout(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Error::RateLimited {
            message: msg.into(),
            retry_after_ms,
        }
    }

    /// Create a malformed-output error (never retried)
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedOutput(msg.into())
    }

    /// Create an upstream error, optionally carrying the HTTP status
    pub fn upstream(status: Option<u16>, msg: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable machine-readable kind, used in client-facing failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::InvalidInput(_) => "invalid_input",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionBusy(_) => "session_busy",
            Error::LoopLimit(_) => "loop_limit",
            Error::UpstreamTimeout(_) => "upstream_timeout",
            Error::RateLimited { .. } => "rate_limited",
            Error::MalformedOutput(_) => "malformed_output",
            Error::Upstream { .. } => "upstream",
            Error::Cancelled => "cancelled",
            Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => "internal",
        }
    }

    /// Whether the model gateway may retry the attempt that produced this error.
    ///
    /// Timeouts, rate limits, connection failures and 5xx responses are
    /// transient. Malformed output and client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpstreamTimeout(_) | Error::RateLimited { .. } => true,
            Error::Upstream { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            _ => false,
        }
    }

    /// Server-provided minimum delay before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
