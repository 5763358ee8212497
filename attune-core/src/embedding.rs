//! Vector embedding abstraction layer.
//!
//! Embeddings back the similarity search and are filled in lazily by the
//! backfill job. Remote providers live in `attune-pipeline` on top of the
//! LLM client; this module holds the trait and an offline provider.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::Result;
use crate::types::Embedding;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Generate vector embeddings from text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    ///
    /// # Errors
    /// Returns `AttuneError::Embedding` if the provider fails.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed a batch of texts, in order.
    ///
    /// Default implementation calls `embed` in a loop. Remote providers
    /// should override this with a native batch call.
    ///
    /// # Errors
    /// Returns an error if any embedding in the batch fails.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    /// Dimensionality of produced embeddings.
    fn dimensions(&self) -> usize;

    /// Model name, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Feature hashing
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embeddings via the hashing trick.
///
/// Each lower-cased token (plus each adjacent token pair) is hashed to a
/// bucket with a hashed sign; the vector is L2-normalised. Texts that share
/// words land close together, which is all the offline search needs.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dims: usize,
}

impl HashingEmbeddingProvider {
    /// Provider with the given dimensionality (at least 1).
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dims: dimensions.max(1),
        }
    }

    /// Synchronous embedding.
    #[must_use]
    pub fn embed_sync(&self, text: &str) -> Embedding {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .collect();

        let mut v = vec![0.0_f32; self.dims];
        let mut add = |feature: &dyn Fn(&mut DefaultHasher), weight: f32| {
            let mut h = DefaultHasher::new();
            feature(&mut h);
            let hash = h.finish();
            #[allow(clippy::cast_possible_truncation)]
            let bucket = (hash % self.dims as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign * weight;
        };
        for t in &tokens {
            add(&|h| t.hash(h), 1.0);
        }
        for pair in tokens.windows(2) {
            add(&|h| (pair[0], pair[1]).hash(h), 0.5);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        Embedding(v)
    }
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_unit_length() {
        let p = HashingEmbeddingProvider::new(64);
        let a = p.embed_sync("Works night shifts at the hospital");
        let b = p.embed_sync("Works night shifts at the hospital");
        assert_eq!(a, b);
        let mag: f32 = a.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-4);
    }

    #[test]
    fn shared_words_are_closer_than_disjoint() {
        let p = HashingEmbeddingProvider::default();
        let base = p.embed_sync("considering a new job offer in Berlin");
        let near = p.embed_sync("the Berlin job offer pays more");
        let far = p.embed_sync("grandmother's lasagna recipe");
        assert!(base.cosine_similarity(&near) > base.cosine_similarity(&far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let p = HashingEmbeddingProvider::new(8);
        assert!(p.embed_sync("").0.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let p = HashingEmbeddingProvider::new(16);
        let texts = vec!["alpha beta".to_string(), "gamma delta".to_string()];
        let out = p.embed_batch(&texts).await.expect("batch");
        assert_eq!(out[0], p.embed_sync("alpha beta"));
        assert_eq!(out[1], p.embed_sync("gamma delta"));
    }
}
