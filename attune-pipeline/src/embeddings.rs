//! Embedding provider backed by the completion backend's embeddings call.

use std::sync::Arc;

use async_trait::async_trait;
use attune_core::embedding::EmbeddingProvider;
use attune_core::error::{AttuneError, Result};
use attune_core::types::Embedding;
use attune_llm::{CompletionBackend, RetryPolicy, with_retry};

/// [`EmbeddingProvider`] over a [`CompletionBackend`], with retries.
pub struct LlmEmbeddingProvider {
    backend: Arc<dyn CompletionBackend>,
    policy: RetryPolicy,
    model: String,
    dimensions: usize,
}

impl std::fmt::Debug for LlmEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmEmbeddingProvider")
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl LlmEmbeddingProvider {
    /// Provider for `model` producing `dimensions`-wide vectors.
    #[must_use]
    pub fn new(backend: Arc<dyn CompletionBackend>, policy: RetryPolicy, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            backend,
            policy,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LlmEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| AttuneError::Embedding("provider returned no embedding".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = with_retry(&self.policy, "embed", || self.backend.embed(texts))
            .await
            .map_err(|e| AttuneError::Embedding(e.to_string()))?;
        if vectors.len() != texts.len() {
            return Err(AttuneError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors.into_iter().map(Embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
