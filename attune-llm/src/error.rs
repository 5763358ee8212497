//! Provider error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a completion provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed (network error, unexpected status).
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    /// Provider response was not the shape we asked for.
    #[error("failed to parse provider response: {0}")]
    Parse(String),

    /// Structured output parsed but violated the expected schema.
    #[error("LLM output schema validation failed: {0}")]
    SchemaValidation(String),

    /// The call exceeded its explicit time bound.
    #[error("LLM request timed out after {0}ms")]
    Timeout(u64),

    /// Provider is unreachable or returned a server error.
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),

    /// Provider signalled a rate limit (HTTP 429).
    #[error("rate limited by provider: {message}")]
    RateLimited {
        /// `Retry-After` hint, when the provider sent one.
        retry_after: Option<Duration>,
        /// Provider message.
        message: String,
    },

    /// No API key is configured; the named feature cannot run.
    #[error("{0} requires an API key")]
    MissingCredential(String),

    /// The provider rejected the configured key.
    #[error("API key rejected by provider: {0}")]
    InvalidCredential(String),

    /// Every attempt failed. `source` is the final cause.
    #[error("all {attempts} attempts failed: {source}")]
    RetriesExhausted {
        /// Attempts made (rate-limit waits excluded).
        attempts: u32,
        /// Last error seen.
        source: Box<LlmError>,
    },

    /// Client misconfiguration.
    #[error("LLM configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Transient errors worth another attempt after a short delay.
    ///
    /// Rate limits are handled separately (long cooldown), and credential
    /// or configuration problems never heal by retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_) | Self::Parse(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }

    /// Whether this is (or was finally caused by) a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::RetriesExhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether this is a credential problem (missing or rejected key).
    #[must_use]
    pub fn is_credential(&self) -> bool {
        match self {
            Self::MissingCredential(_) | Self::InvalidCredential(_) => true,
            Self::RetriesExhausted { source, .. } => source.is_credential(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else if err.is_decode() {
            LlmError::Parse(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Parse(err.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, LlmError>;
