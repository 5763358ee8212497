//! Pipeline error type.

use attune_core::AttuneError;
use attune_llm::LlmError;
use thiserror::Error;

/// Errors raised by pipeline stages and batch jobs.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Storage, search or data-model failure.
    #[error(transparent)]
    Core(#[from] AttuneError),

    /// Provider failure.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// A provider answered with nothing usable.
    #[error("{stage}: provider returned an empty distribution")]
    EmptyDistribution {
        /// Stage that made the call.
        stage: &'static str,
    },

    /// Logging or runtime setup failed.
    #[error("setup failed: {0}")]
    Setup(String),
}

impl PipelineError {
    /// Whether this failure comes from a missing or rejected API key.
    #[must_use]
    pub fn is_credential(&self) -> bool {
        matches!(self, Self::Llm(e) if e.is_credential())
    }

    /// Whether this is a partially applied consolidation write.
    #[must_use]
    pub fn is_partial_resolution(&self) -> bool {
        matches!(self, Self::Core(AttuneError::PartialResolution { .. }))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
