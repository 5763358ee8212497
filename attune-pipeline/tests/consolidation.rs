//! Consolidation scans end to end over an in-memory store and a scripted provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attune_core::config::ConsolidationConfig;
use attune_core::error::{AttuneError, Result as CoreResult};
use attune_core::repository::{MemoryRepository, memory_key};
use attune_core::search::{SearchQuery, SimilaritySearch};
use attune_core::storage::{InMemoryStore, KvStore, StoreChange, UpdateFn, Updated};
use attune_core::surprise::{InvalidationSink, SurpriseCache};
use attune_core::types::{LifeDomain, Memory, MemoryCategory, MemoryId, ScoredMemory, ValidationState};
use attune_llm::mock::ScriptedBackend;
use attune_llm::RetryPolicy;
use attune_pipeline::invalidation::CONSOLIDATION_EVENT_KEY;
use attune_pipeline::{MemoryConsolidator, PipelineMetrics, ScanProgress};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Every active memory is a close neighbour.
struct AllActive(MemoryRepository);

#[async_trait]
impl SimilaritySearch for AllActive {
    async fn search(&self, query: &SearchQuery) -> CoreResult<Vec<ScoredMemory>> {
        Ok(self
            .0
            .list_active()
            .await?
            .into_iter()
            .take(query.limit)
            .map(|m| ScoredMemory::new(m, 0.9))
            .collect())
    }
}

/// Fails writes to one key.
struct PoisonedStore {
    inner: InMemoryStore,
    poisoned: Mutex<Option<String>>,
}

#[async_trait]
impl KvStore for PoisonedStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: Value) -> CoreResult<()> {
        let poisoned = self.poisoned.lock().as_deref() == Some(key);
        if poisoned {
            return Err(AttuneError::Storage("disk full".into()));
        }
        self.inner.set(key, value).await
    }
    async fn update(&self, key: &str, f: UpdateFn) -> CoreResult<Updated> {
        let poisoned = self.poisoned.lock().as_deref() == Some(key);
        if poisoned {
            return Err(AttuneError::Storage("disk full".into()));
        }
        self.inner.update(key, f).await
    }
    async fn delete(&self, key: &str) -> CoreResult<bool> {
        self.inner.delete(key).await
    }
    async fn keys(&self, prefix: &str) -> CoreResult<Vec<String>> {
        self.inner.keys(prefix).await
    }
    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.subscribe()
    }
}

fn fact(content: &str, state: ValidationState) -> Memory {
    Memory::new(content, MemoryCategory::Fact, LifeDomain::Work, 0.4, Utc::now()).with_validation(state)
}

fn verdict(ids: &[MemoryId], content: &str) -> String {
    json!({
        "has_conflict": true,
        "conflicting_ids": ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "resolution_type": "update",
        "consolidated_content": content,
        "explanation": "the user changed jobs"
    })
    .to_string()
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        retry_delay: Duration::from_millis(5),
        ..RetryPolicy::default()
    }
}

fn config() -> ConsolidationConfig {
    ConsolidationConfig {
        requests_per_minute: 600,
        burst: 10,
        ..ConsolidationConfig::default()
    }
}

fn consolidator(repo: &MemoryRepository, backend: Arc<ScriptedBackend>) -> MemoryConsolidator {
    MemoryConsolidator::new(
        repo.clone(),
        Arc::new(AllActive(repo.clone())),
        backend,
        policy(),
        config(),
    )
}

async fn state_of(repo: &MemoryRepository, id: MemoryId) -> ValidationState {
    repo.get(id).await.expect("get").expect("present").validation
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_conflict_yields_one_record_and_one_invalidation() {
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    let old = fact("Works at Acme as a data engineer", ValidationState::Validated);
    let new = fact("Just started a new job at Globex", ValidationState::Provisional);
    repo.put(&old).await.expect("put");
    repo.put(&new).await.expect("put");

    let backend = Arc::new(ScriptedBackend::new());
    backend.push_json(Ok(verdict(&[old.id], "Works at Globex (previously Acme)")));
    let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 10, 10));
    cache.insert(old.id, 7, 1.5);
    let metrics = Arc::new(PipelineMetrics::new());

    let report = consolidator(&repo, backend.clone())
        .with_sink(cache.clone())
        .with_metrics(metrics.clone())
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");

    assert_eq!(report.scanned, 1);
    assert_eq!(report.resolved, 1);
    assert!(report.failed.is_empty());
    assert_eq!(backend.json_calls(), 1);

    assert_eq!(state_of(&repo, old.id).await, ValidationState::Invalidated);
    assert_eq!(state_of(&repo, new.id).await, ValidationState::Outdated);
    let consolidated = repo
        .list_by_state(ValidationState::Consolidated, 10)
        .await
        .expect("list");
    assert_eq!(consolidated.len(), 1);
    assert_eq!(consolidated[0].content, "Works at Globex (previously Acme)");
    assert_eq!(consolidated[0].domain, LifeDomain::Work);

    assert!(cache.is_empty());
    assert!(repo.store().get(CONSOLIDATION_EVENT_KEY).await.expect("get").is_some());
    assert_eq!(metrics.snapshot().conflicts_resolved, 1);
}

#[tokio::test]
async fn clean_candidate_is_left_untouched() {
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    let old = fact("Enjoys climbing on weekends", ValidationState::Validated);
    let new = fact("Drinks oat milk", ValidationState::Provisional);
    repo.put(&old).await.expect("put");
    repo.put(&new).await.expect("put");

    let backend = Arc::new(ScriptedBackend::new());
    let report = consolidator(&repo, backend.clone())
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");

    assert_eq!(report.clean, 1);
    assert_eq!(report.resolved, 0);
    assert_eq!(state_of(&repo, new.id).await, ValidationState::Provisional);
    assert_eq!(state_of(&repo, old.id).await, ValidationState::Validated);
}

#[tokio::test]
async fn lone_candidate_makes_no_provider_call() {
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    repo.put(&fact("Has a standing desk", ValidationState::Provisional))
        .await
        .expect("put");
    let backend = Arc::new(ScriptedBackend::new());
    let report = consolidator(&repo, backend.clone())
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");
    assert_eq!(report.clean, 1);
    assert_eq!(backend.json_calls(), 0);
}

#[tokio::test]
async fn invented_ids_are_ignored() {
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    let old = fact("Lives in Lisbon", ValidationState::Validated);
    let new = fact("Moved to Porto", ValidationState::Provisional);
    repo.put(&old).await.expect("put");
    repo.put(&new).await.expect("put");

    let backend = Arc::new(ScriptedBackend::new());
    backend.push_json(Ok(verdict(&[MemoryId::new()], "Lives in Porto")));
    let report = consolidator(&repo, backend)
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");

    assert_eq!(report.clean, 1);
    assert_eq!(state_of(&repo, old.id).await, ValidationState::Validated);
    assert!(repo
        .list_by_state(ValidationState::Consolidated, 10)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn malformed_verdict_fails_only_that_candidate() {
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    let old = fact("Prefers mornings for deep work", ValidationState::Validated);
    let new = fact("Now does deep work late at night", ValidationState::Provisional);
    repo.put(&old).await.expect("put");
    repo.put(&new).await.expect("put");

    let backend = Arc::new(ScriptedBackend::new());
    backend.push_json(Ok("this is not json".into()));
    let report = consolidator(&repo, backend)
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, new.id);
    assert_eq!(state_of(&repo, new.id).await, ValidationState::Provisional);
}

#[tokio::test]
async fn failed_write_is_reported_as_partial_and_rolled_back() {
    let store = Arc::new(PoisonedStore {
        inner: InMemoryStore::new(),
        poisoned: Mutex::new(None),
    });
    let repo = MemoryRepository::new(store.clone());
    let old = fact("Manages a team of four", ValidationState::Validated);
    let new = fact("Went back to an individual contributor role", ValidationState::Provisional);
    repo.put(&old).await.expect("put");
    repo.put(&new).await.expect("put");
    *store.poisoned.lock() = Some(memory_key(new.id));

    let backend = Arc::new(ScriptedBackend::new());
    backend.push_json(Ok(verdict(&[old.id], "Is an individual contributor again")));
    let metrics = Arc::new(PipelineMetrics::new());
    let report = consolidator(&repo, backend)
        .with_metrics(metrics.clone())
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");

    assert_eq!(report.partial, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(metrics.snapshot().partial_resolutions, 1);
    assert_eq!(state_of(&repo, old.id).await, ValidationState::Validated);
    assert!(repo
        .list_by_state(ValidationState::Consolidated, 10)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn progress_reports_every_candidate() {
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    for content in ["Owns a bike", "Walks to work", "Takes the train on Fridays"] {
        repo.put(&fact(content, ValidationState::Provisional)).await.expect("put");
    }
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress = move |p: ScanProgress| sink.lock().push(p.processed);
    let progress: &(dyn Fn(ScanProgress) + Send + Sync) = &progress;

    let report = consolidator(&repo, Arc::new(ScriptedBackend::new()))
        .scan_and_consolidate(2, Some(progress))
        .await
        .expect("scan");

    assert_eq!(report.scanned, 2);
    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[tokio::test]
async fn sink_is_not_notified_without_a_resolution() {
    struct Counting(Mutex<usize>);
    impl InvalidationSink for Counting {
        fn invalidate_all(&self) {
            *self.0.lock() += 1;
        }
    }
    let repo = MemoryRepository::new(Arc::new(InMemoryStore::new()));
    repo.put(&fact("Plays chess", ValidationState::Provisional)).await.expect("put");
    let counting = Arc::new(Counting(Mutex::new(0)));
    consolidator(&repo, Arc::new(ScriptedBackend::new()))
        .with_sink(counting.clone())
        .scan_and_consolidate(10, None)
        .await
        .expect("scan");
    assert_eq!(*counting.0.lock(), 0);
}
