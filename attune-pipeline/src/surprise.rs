//! Surprise scoring: how much a memory shifts the model's next token.
//!
//! For each (memory, message) pair the scorer probes the provider twice,
//! concurrently: once without the memory (baseline Q) and once with it in
//! the system prompt (conditioned P). Both top-K first-token distributions
//! are renormalised and scored as KL(P‖Q) in bits. Scores are cached per
//! (memory id, message hash); a score computed across a cache invalidation
//! is returned but not stored.

use std::collections::HashMap;
use std::sync::Arc;

use attune_core::surprise::{SurpriseCache, TokenDistribution, context_hash, kl_divergence};
use attune_core::types::{Memory, MemoryId, ScoredMemory};
use attune_llm::prompt::{PromptEngine, PromptId};
use attune_llm::{ChatMessage, CompletionBackend, RetryPolicy, TokenLogprob, with_retry};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;

/// Scores for one request's memories.
#[derive(Debug, Clone, Default)]
pub struct SurpriseBatch {
    /// Scores in bits, for the memories that could be scored.
    pub scores: HashMap<MemoryId, f64>,
    /// Memories whose probe pair failed.
    pub failures: usize,
    /// The provider has no usable key; nothing was probed.
    pub missing_credential: bool,
}

/// Computes (and caches) surprise scores.
pub struct SurpriseScorer {
    backend: Arc<dyn CompletionBackend>,
    cache: Arc<SurpriseCache>,
    prompts: Arc<PromptEngine>,
    policy: RetryPolicy,
    top_k: u8,
    metrics: Arc<PipelineMetrics>,
}

impl std::fmt::Debug for SurpriseScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurpriseScorer")
            .field("backend", &self.backend.name())
            .field("top_k", &self.top_k)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SurpriseScorer {
    /// Scorer probing `backend` and caching into `cache`.
    ///
    /// `top_k` is raised to at least 20; smaller slices make the KL
    /// estimate too noisy.
    #[must_use]
    pub fn new(backend: Arc<dyn CompletionBackend>, cache: Arc<SurpriseCache>, policy: RetryPolicy, top_k: u8) -> Self {
        Self {
            backend,
            cache,
            prompts: Arc::new(PromptEngine::builtin()),
            policy,
            top_k: top_k.max(20),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Use custom prompt templates.
    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<PromptEngine>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Report into shared counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The cache this scorer writes to.
    #[must_use]
    pub fn cache(&self) -> &Arc<SurpriseCache> {
        &self.cache
    }

    /// Surprise of `memory` for `message`, in bits.
    ///
    /// # Errors
    /// Any provider failure of either probe (after retries), or an empty
    /// distribution. Callers skip surprise re-ranking for this memory.
    pub async fn score(&self, memory: &Memory, message: &str) -> Result<f64> {
        let context = context_hash(message);
        if let Some(score) = self.cache.get(memory.id, context) {
            PipelineMetrics::incr(&self.metrics.surprise_cache_hits);
            return Ok(score);
        }
        PipelineMetrics::incr(&self.metrics.surprise_cache_misses);
        let generation = self.cache.generation();

        let (baseline_system, baseline_user) = self.prompts.render(PromptId::SurpriseBaseline, &[("message", message)])?;
        let (conditioned_system, conditioned_user) = self.prompts.render(
            PromptId::SurpriseConditioned,
            &[("memory", memory.content.as_str()), ("message", message)],
        )?;
        let baseline = [ChatMessage::system(baseline_system), ChatMessage::user(baseline_user)];
        let conditioned = [ChatMessage::system(conditioned_system), ChatMessage::user(conditioned_user)];

        // Both halves or nothing.
        let (q, p) = tokio::try_join!(self.probe(&baseline), self.probe(&conditioned))?;
        let q = distribution(&q);
        let p = distribution(&p);
        if p.is_empty() || q.is_empty() {
            return Err(PipelineError::EmptyDistribution { stage: "surprise" });
        }

        let score = kl_divergence(&p, &q);
        if !self.cache.insert_if_generation(generation, memory.id, context, score) {
            debug!(memory_id = %memory.id, "cache invalidated during probe, score not cached");
        }
        debug!(memory_id = %memory.id, score, "surprise scored");
        Ok(score)
    }

    /// Score every memory concurrently. Failures are counted, never fatal.
    pub async fn score_all(&self, memories: &[ScoredMemory], message: &str) -> SurpriseBatch {
        let results = join_all(memories.iter().map(|m| async move { (m.memory.id, self.score(&m.memory, message).await) })).await;

        let mut batch = SurpriseBatch::default();
        for (id, result) in results {
            match result {
                Ok(score) => {
                    batch.scores.insert(id, score);
                }
                Err(e) if e.is_credential() => {
                    batch.missing_credential = true;
                    batch.failures += 1;
                }
                Err(e) => {
                    warn!(memory_id = %id, error = %e, "surprise probe failed, keeping similarity rank");
                    PipelineMetrics::incr(&self.metrics.probe_failures);
                    batch.failures += 1;
                }
            }
        }
        batch
    }

    async fn probe(&self, messages: &[ChatMessage]) -> Result<Vec<TokenLogprob>> {
        let top = with_retry(&self.policy, "surprise_probe", || {
            self.backend.first_token_logprobs(messages, self.top_k)
        })
        .await?;
        Ok(top)
    }
}

fn distribution(top: &[TokenLogprob]) -> TokenDistribution {
    TokenDistribution::from_logprobs(top.iter().map(|t| (t.token.as_str(), t.logprob)))
}

/// Re-rank by similarity plus a bounded surprise bonus.
///
/// `combined = similarity + weight · s / (1 + s)` where `s` is the score in
/// bits. Memories without a score keep their similarity. The sort is
/// stable, so ties keep the incoming order.
#[must_use]
pub fn rerank(mut memories: Vec<ScoredMemory>, scores: &HashMap<MemoryId, f64>, weight: f32) -> Vec<ScoredMemory> {
    if scores.is_empty() || weight <= 0.0 {
        return memories;
    }
    let combined = |m: &ScoredMemory| -> f64 {
        let bonus = scores
            .get(&m.memory.id)
            .map_or(0.0, |s| f64::from(weight) * s.max(0.0) / (1.0 + s.max(0.0)));
        f64::from(m.similarity) + bonus
    };
    memories.sort_by(|a, b| combined(b).total_cmp(&combined(a)));
    memories
}
