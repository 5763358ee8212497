//! The provider contract consumed by the pipeline.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChatMessage, JsonRequest, TokenLogprob};

/// The three call shapes attune needs from a completion provider.
///
/// Implementations make exactly one provider call per method invocation;
/// retries, timeouts and pacing are layered on top by the caller (see
/// [`crate::retry`] and [`crate::ratelimit`]).
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Generate a single token for `messages` and return the top-`top_k`
    /// candidates for it with their log-probabilities.
    ///
    /// # Errors
    /// Provider, transport or credential failures.
    async fn first_token_logprobs(&self, messages: &[ChatMessage], top_k: u8) -> Result<Vec<TokenLogprob>>;

    /// Run a JSON-mode completion and return the raw JSON text.
    ///
    /// # Errors
    /// Provider, transport or credential failures.
    async fn complete_json(&self, request: &JsonRequest) -> Result<String>;

    /// Embed `texts`, returning one vector per input in order.
    ///
    /// # Errors
    /// Provider, transport or credential failures.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Backend name, for logs.
    fn name(&self) -> &str;
}
