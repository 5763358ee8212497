//! The per-message path over real storage, hashing embeddings and a scripted provider.

use std::sync::Arc;
use std::time::Duration;

use attune_core::config::AttuneConfig;
use attune_core::embedding::HashingEmbeddingProvider;
use attune_core::goal::KeywordGoalExtractor;
use attune_core::opspec::OpSpecRouter;
use attune_core::repository::MemoryRepository;
use attune_core::search::LocalSimilaritySearch;
use attune_core::storage::{InMemoryStore, KvStore, SqliteStore};
use attune_core::surprise::SurpriseCache;
use attune_core::types::{LifeDomain, Memory, MemoryCategory};
use attune_llm::mock::{ScriptedBackend, prompt_text};
use attune_llm::{ClientOptions, LlmClient, LlmProvider, RetryPolicy, TokenLogprob};
use attune_pipeline::invalidation::{CONSOLIDATION_EVENT_KEY, OPSPEC_CATALOG_KEY, spawn_invalidation_listener};
use attune_pipeline::{ContextPipeline, PipelineMetrics, StageSkip, SurpriseScorer};
use chrono::Utc;
use serde_json::json;

async fn seeded_repo(store: Arc<dyn KvStore>) -> MemoryRepository {
    let repo = MemoryRepository::new(store);
    let seeds = [
        ("Has two rescue cats named Miso and Tofu", MemoryCategory::Fact, LifeDomain::Home),
        ("Prefers short direct answers", MemoryCategory::PartnerModel, LifeDomain::Growth),
        ("Training for a half marathon in the spring", MemoryCategory::Value, LifeDomain::Health),
    ];
    for (content, category, domain) in seeds {
        repo.put(&Memory::new(content, category, domain, 0.3, Utc::now()))
            .await
            .expect("put");
    }
    repo
}

fn search(repo: &MemoryRepository) -> Arc<LocalSimilaritySearch> {
    Arc::new(LocalSimilaritySearch::new(
        repo.clone(),
        Arc::new(HashingEmbeddingProvider::new(256)),
    ))
}

fn keyless_client() -> LlmClient {
    LlmClient::new(
        LlmProvider::OpenAiCompatible {
            base_url: "http://127.0.0.1:9".into(),
            api_key: None,
        },
        ClientOptions::default(),
    )
    .expect("client")
}

fn cat_backend() -> ScriptedBackend {
    ScriptedBackend::new().with_logprobs(|msgs| {
        let (a, b) = if prompt_text(msgs).contains("cats") { (0.85_f64, 0.15_f64) } else { (0.5, 0.5) };
        Ok(vec![TokenLogprob::new("Yes", a.ln()), TokenLogprob::new("No", b.ln())])
    })
}

#[tokio::test]
async fn related_memory_reaches_the_injected_message() {
    let repo = seeded_repo(Arc::new(InMemoryStore::new())).await;
    let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 100, 50));
    let backend = Arc::new(cat_backend());
    let scorer = SurpriseScorer::new(backend.clone(), Arc::clone(&cache), RetryPolicy::default(), 20);

    let pipeline = ContextPipeline::new(AttuneConfig::default(), search(&repo))
        .with_goal_extractor(Arc::new(KeywordGoalExtractor::new(6)))
        .with_surprise(Arc::new(scorer))
        .with_repository(repo.clone());

    let message = "my cats keep knocking things off the shelf, how do I stop them?";
    let injected = pipeline.inject(message, &[]).await;

    assert!(injected.starts_with("<context>"));
    assert!(injected.ends_with(message));
    assert!(injected.contains("Miso and Tofu"));
    assert!(backend.probe_calls() > 0);
    assert!(!cache.is_empty());

    let surfaced = repo
        .list()
        .await
        .expect("list")
        .into_iter()
        .find(|m| m.content.contains("Miso"))
        .expect("seeded");
    assert_eq!(surfaced.access_count, 1);
}

#[tokio::test]
async fn second_request_reuses_cached_scores() {
    let repo = seeded_repo(Arc::new(InMemoryStore::new())).await;
    let backend = Arc::new(cat_backend());
    let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 100, 50));
    let metrics = Arc::new(PipelineMetrics::new());
    let scorer = SurpriseScorer::new(backend.clone(), cache, RetryPolicy::default(), 20)
        .with_metrics(Arc::clone(&metrics));
    let pipeline = ContextPipeline::new(AttuneConfig::default(), search(&repo))
        .with_surprise(Arc::new(scorer))
        .with_metrics(Arc::clone(&metrics));

    let message = "any advice for keeping the cats entertained?";
    pipeline.build_context(message, &[]).await;
    let probes = backend.probe_calls();
    pipeline.build_context(message, &[]).await;

    assert_eq!(backend.probe_calls(), probes);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.requests, 2);
    assert!(snapshot.surprise_cache_hits > 0);
}

#[tokio::test]
async fn missing_key_degrades_but_still_injects() {
    let repo = seeded_repo(Arc::new(InMemoryStore::new())).await;
    let scorer = SurpriseScorer::new(
        Arc::new(keyless_client()),
        Arc::new(SurpriseCache::new(Duration::from_secs(300), 100, 50)),
        RetryPolicy::default(),
        20,
    );
    let pipeline = ContextPipeline::new(AttuneConfig::default(), search(&repo)).with_surprise(Arc::new(scorer));

    let result = pipeline.build_context("what should I feed my cats?", &[]).await;

    assert!(result.block.contains("Miso and Tofu"));
    assert!(result.surprise.is_empty());
    assert!(result
        .skipped
        .iter()
        .any(|s| matches!(s, StageSkip::MissingCredential { .. })));
}

#[tokio::test]
async fn sqlite_backed_pipeline_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("attune.db");
    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(path.to_str().expect("utf-8 path"), true).expect("open"));
    let repo = seeded_repo(store).await;
    let pipeline = ContextPipeline::new(AttuneConfig::default(), search(&repo)).with_repository(repo.clone());

    let result = pipeline.build_context("tips for a half marathon training plan?", &[]).await;

    assert!(result.block.contains("half marathon"));
    assert!(result.skipped.is_empty());
}

#[tokio::test]
async fn consolidation_event_and_catalog_update_reach_the_pipeline() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let repo = seeded_repo(Arc::clone(&store)).await;
    let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 100, 50));
    let router = Arc::new(OpSpecRouter::with_default_catalog());
    let listener = spawn_invalidation_listener(Arc::clone(&store), cache.clone(), Arc::clone(&router));

    let scorer = SurpriseScorer::new(Arc::new(cat_backend()), Arc::clone(&cache), RetryPolicy::default(), 20);
    let pipeline = ContextPipeline::new(AttuneConfig::default(), search(&repo))
        .with_surprise(Arc::new(scorer))
        .with_router(Arc::clone(&router));

    pipeline.build_context("the cats woke me up at 5am again", &[]).await;
    assert!(!cache.is_empty());

    store.set(CONSOLIDATION_EVENT_KEY, json!({ "n": 1 })).await.expect("set");
    store
        .set(
            OPSPEC_CATALOG_KEY,
            json!([{ "id": "terse", "priority": 0, "content": "Answer in one sentence." }]),
        )
        .await
        .expect("set");
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(cache.is_empty());
    let result = pipeline.build_context("the cats woke me up at 5am again", &[]).await;
    assert!(result.block.starts_with("Answer in one sentence."));
    listener.abort();
}
