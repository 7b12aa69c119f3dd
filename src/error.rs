//! Core error taxonomy
//! Mission: One error vocabulary shared by adapters, pipeline and scheduler

use thiserror::Error;

/// Coarse error kind driving the scheduler's propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials rejected by a remote system. Stops the agent.
    Auth,
    /// Remote rate limit hit. Skip the tick, retry next tick.
    RateLimit,
    /// Deadline exceeded on an outbound call. Skip the tick.
    Timeout,
    /// Bad or missing setup (unknown venue, disabled config...). Stops the agent.
    Config,
    /// A decision action failed a risk check. Downgraded, never fatal.
    Validation,
    /// Exchange or LLM answered with a failure payload. Skip the tick.
    Provider,
    /// Network / IO hiccup expected to heal on its own. Skip the tick.
    TransientIo,
    /// Unrecoverable worker state. Kills the worker.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::RateLimit => "RATE_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::Config => "CONFIG",
            Self::Validation => "VALIDATION",
            Self::Provider => "PROVIDER_ERROR",
            Self::TransientIo => "TRANSIENT_IO",
            Self::Fatal => "FATAL",
        }
    }

    /// True for kinds that should stop the agent instead of skipping the tick.
    pub fn stops_agent(&self) -> bool {
        matches!(self, Self::Auth | Self::Config)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("auth rejected: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("validation failed ({reason}): {detail}")]
    Validation { reason: String, detail: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("transient io: {0}")]
    TransientIo(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::RateLimit(_) => ErrorKind::RateLimit,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Provider(_) => ErrorKind::Provider,
            Self::TransientIo(_) => ErrorKind::TransientIo,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn validation(reason: &str, detail: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.to_string(),
            detail: detail.into(),
        }
    }

    /// Short operator-facing summary stored on the agent record.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.kind().as_str(), self)
    }
}

/// Map an outbound reqwest failure onto the taxonomy.
impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            Self::TransientIo(e.to_string())
        } else {
            Self::Provider(e.to_string())
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
