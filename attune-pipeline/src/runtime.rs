//! Wiring everything together from one [`AttuneConfig`].

use std::sync::Arc;
use std::time::Duration;

use attune_core::config::{AttuneConfig, LlmConfig};
use attune_core::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use attune_core::goal::KeywordGoalExtractor;
use attune_core::opspec::OpSpecRouter;
use attune_core::repository::MemoryRepository;
use attune_core::search::{LocalSimilaritySearch, SimilaritySearch};
use attune_core::storage::{KvStore, open_store};
use attune_core::surprise::{InvalidationSink, SurpriseCache};
use attune_llm::ratelimit::RateLimitBudget;
use attune_llm::{ClientOptions, CompletionBackend, LlmClient, LlmProvider, RetryPolicy};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::consolidator::MemoryConsolidator;
use crate::embeddings::LlmEmbeddingProvider;
use crate::error::Result;
use crate::invalidation::spawn_invalidation_listener;
use crate::metrics::PipelineMetrics;
use crate::pipeline::ContextPipeline;
use crate::surprise::SurpriseScorer;

/// Width of provider embeddings (`text-embedding-3-small`).
pub const PROVIDER_EMBEDDING_DIMENSIONS: usize = 1536;

/// Width of the offline hashing embeddings used without an API key.
pub const LOCAL_EMBEDDING_DIMENSIONS: usize = 256;

/// Client options for `config`.
#[must_use]
pub fn client_options(config: &LlmConfig) -> ClientOptions {
    ClientOptions {
        probe_model: config.probe_model.clone(),
        analysis_model: config.analysis_model.clone(),
        embedding_model: config.embedding_model.clone(),
        request_timeout: Duration::from_millis(config.request_timeout_ms),
        auth_timeout: Duration::from_millis(config.auth_timeout_ms),
    }
}

/// Retry policy for `config`.
#[must_use]
pub fn retry_policy(config: &LlmConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.max_attempts.max(1),
        retry_delay: Duration::from_millis(config.retry_delay_ms),
        rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
        max_rate_limit_waits: config.max_rate_limit_waits,
        call_timeout: Duration::from_millis(config.request_timeout_ms),
    }
}

/// Retry policy for provider calls made while a user message waits.
///
/// No rate-limit cooldowns, and no attempt may outlast the surprise
/// budget; a throttled probe fails fast and the stage is skipped.
#[must_use]
pub fn request_path_policy(config: &AttuneConfig) -> RetryPolicy {
    let base = retry_policy(&config.llm);
    RetryPolicy {
        rate_limit_cooldown: Duration::ZERO,
        max_rate_limit_waits: 0,
        call_timeout: base.call_timeout.min(Duration::from_millis(config.surprise.budget_ms)),
        ..base
    }
}

/// Shared components of one attune process.
pub struct AttuneRuntime {
    /// Loaded configuration.
    pub config: AttuneConfig,
    /// Backing store.
    pub store: Arc<dyn KvStore>,
    /// Memory records over `store`.
    pub repo: MemoryRepository,
    /// Provider client.
    pub client: Arc<LlmClient>,
    /// Embeddings for search and backfill.
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// Similarity search over `repo`.
    pub search: Arc<dyn SimilaritySearch>,
    /// Surprise score cache.
    pub cache: Arc<SurpriseCache>,
    /// OpSpec router.
    pub router: Arc<OpSpecRouter>,
    /// Process-wide counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Retry policy for background provider calls.
    pub policy: RetryPolicy,
}

impl std::fmt::Debug for AttuneRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttuneRuntime")
            .field("storage", &self.config.storage.backend)
            .field("client", &self.client)
            .field("embedder", &self.embedder.model_name())
            .finish_non_exhaustive()
    }
}

impl AttuneRuntime {
    /// Open the store and build every component.
    ///
    /// Without an API key, embeddings fall back to the offline hashing
    /// provider and provider-backed stages report a missing credential.
    ///
    /// # Errors
    /// Store open failures and HTTP client construction failures.
    pub fn from_config(config: AttuneConfig) -> Result<Self> {
        let store = open_store(&config.storage)?;
        let repo = MemoryRepository::new(Arc::clone(&store));
        let api_key = config.llm.resolve_api_key();
        let has_key = api_key.is_some();
        let client = Arc::new(LlmClient::new(
            LlmProvider::OpenAiCompatible {
                base_url: config.llm.base_url.clone(),
                api_key,
            },
            client_options(&config.llm),
        )?);
        let policy = retry_policy(&config.llm);

        let embedder: Arc<dyn EmbeddingProvider> = if has_key {
            Arc::new(LlmEmbeddingProvider::new(
                Arc::clone(&client) as Arc<dyn CompletionBackend>,
                policy,
                config.llm.embedding_model.clone(),
                PROVIDER_EMBEDDING_DIMENSIONS,
            ))
        } else {
            warn!(
                env = %config.llm.api_key_env,
                "no API key configured, using offline hashing embeddings"
            );
            Arc::new(HashingEmbeddingProvider::new(LOCAL_EMBEDDING_DIMENSIONS))
        };
        let search: Arc<dyn SimilaritySearch> =
            Arc::new(LocalSimilaritySearch::new(repo.clone(), Arc::clone(&embedder)));

        info!(
            storage = %config.storage.backend,
            embedder = embedder.model_name(),
            credential = has_key,
            "attune runtime ready"
        );
        Ok(Self {
            cache: Arc::new(SurpriseCache::from_config(&config.surprise)),
            router: Arc::new(OpSpecRouter::with_default_catalog()),
            metrics: Arc::new(PipelineMetrics::new()),
            store,
            repo,
            client,
            embedder,
            search,
            policy,
            config,
        })
    }

    /// Request pipeline sharing this runtime's cache, router and counters.
    #[must_use]
    pub fn pipeline(&self) -> ContextPipeline {
        let scorer = SurpriseScorer::new(
            Arc::clone(&self.client) as Arc<dyn CompletionBackend>,
            Arc::clone(&self.cache),
            request_path_policy(&self.config),
            self.config.surprise.top_logprobs,
        )
        .with_metrics(Arc::clone(&self.metrics));
        ContextPipeline::new(self.config.clone(), Arc::clone(&self.search))
            .with_goal_extractor(Arc::new(KeywordGoalExtractor::new(self.config.general.recent_turns)))
            .with_surprise(Arc::new(scorer))
            .with_router(Arc::clone(&self.router))
            .with_repository(self.repo.clone())
            .with_metrics(Arc::clone(&self.metrics))
    }

    /// Consolidator that clears this runtime's surprise cache on every resolution.
    #[must_use]
    pub fn consolidator(&self) -> MemoryConsolidator {
        MemoryConsolidator::new(
            self.repo.clone(),
            Arc::clone(&self.search),
            Arc::clone(&self.client) as Arc<dyn CompletionBackend>,
            self.policy,
            self.config.consolidation.clone(),
        )
        .with_sink(Arc::clone(&self.cache) as Arc<dyn InvalidationSink>)
        .with_metrics(Arc::clone(&self.metrics))
    }

    /// Token bucket for the backfill job.
    #[must_use]
    pub fn backfill_budget(&self) -> RateLimitBudget {
        RateLimitBudget::per_minute(self.config.backfill.requests_per_minute, 1)
    }

    /// Start the store-driven invalidation listener.
    #[must_use]
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        spawn_invalidation_listener(
            Arc::clone(&self.store),
            Arc::clone(&self.cache) as Arc<dyn InvalidationSink>,
            Arc::clone(&self.router),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> AttuneConfig {
        let mut config = AttuneConfig::default();
        config.storage.backend = "memory".into();
        config.llm.api_key = None;
        config.llm.api_key_env = "ATTUNE_TEST_KEY_THAT_IS_NEVER_SET".into();
        config
    }

    #[test]
    fn policy_mirrors_config() {
        let mut llm = LlmConfig::default();
        llm.max_attempts = 0;
        llm.retry_delay_ms = 250;
        llm.request_timeout_ms = 2_000;
        let policy = retry_policy(&llm);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.retry_delay, Duration::from_millis(250));
        assert_eq!(policy.call_timeout, Duration::from_secs(2));
    }

    #[test]
    fn request_path_never_waits_out_a_rate_limit() {
        let mut config = AttuneConfig::default();
        config.surprise.budget_ms = 1_200;
        let policy = request_path_policy(&config);
        assert_eq!(policy.max_rate_limit_waits, 0);
        assert_eq!(policy.rate_limit_cooldown, Duration::ZERO);
        assert_eq!(policy.call_timeout, Duration::from_millis(1_200));
        assert_eq!(retry_policy(&config.llm).max_rate_limit_waits, config.llm.max_rate_limit_waits);
    }

    #[test]
    fn offline_runtime_uses_hashing_embeddings() {
        let rt = AttuneRuntime::from_config(offline_config()).expect("runtime");
        assert!(!rt.client.has_credential());
        assert_eq!(rt.embedder.dimensions(), LOCAL_EMBEDDING_DIMENSIONS);
    }

    #[tokio::test]
    async fn offline_pipeline_still_builds_context() {
        let rt = AttuneRuntime::from_config(offline_config()).expect("runtime");
        let result = rt.pipeline().build_context("hello, how are you today?", &[]).await;
        assert!(result.memories.is_empty());
        assert_eq!(rt.metrics.snapshot().requests, 1);
    }
}
