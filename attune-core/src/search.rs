//! Similarity search collaborator.
//!
//! The pipeline only depends on [`SimilaritySearch`]. A hosted vector
//! service implements it in production; [`LocalSimilaritySearch`] is the
//! in-process reference used by the CLI and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::index::{DEFAULT_BRUTE_FORCE_THRESHOLD, VectorIndex};
use crate::repository::MemoryRepository;
use crate::types::{Embedding, LifeDomain, Memory, MemoryCategory, MemoryId, ScoredMemory};

/// A similarity query with optional filters.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Query text.
    pub text: String,
    /// Precomputed query embedding; computed from `text` when absent.
    pub embedding: Option<Embedding>,
    /// Only memories of this category.
    pub category: Option<MemoryCategory>,
    /// Only memories in this domain.
    pub domain: Option<LifeDomain>,
    /// Only memories created at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Drop results below this similarity.
    pub min_similarity: f32,
    /// Maximum results.
    pub limit: usize,
}

impl SearchQuery {
    /// Unfiltered query for `text`.
    #[must_use]
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            embedding: None,
            category: None,
            domain: None,
            since: None,
            min_similarity: 0.0,
            limit,
        }
    }

    /// Set the similarity floor.
    #[must_use]
    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = min;
        self
    }

    /// Restrict to one domain.
    #[must_use]
    pub fn with_domain(mut self, domain: LifeDomain) -> Self {
        self.domain = Some(domain);
        self
    }

    fn accepts(&self, memory: &Memory) -> bool {
        memory.is_active()
            && self.category.is_none_or(|c| memory.category == c)
            && self.domain.is_none_or(|d| memory.domain == d)
            && self.since.is_none_or(|t| memory.created_at >= t)
    }
}

/// Returns ranked candidate memories with similarity in [0, 1].
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Run a query. Retired memories are never returned.
    ///
    /// # Errors
    /// Returns `AttuneError::Search` (or a storage error) on failure.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredMemory>>;
}

/// Snapshot fingerprint: changes whenever a record is added, removed or updated.
type Fingerprint = (usize, Option<DateTime<Utc>>, u64);

struct IndexState {
    fingerprint: Option<Fingerprint>,
    index: Arc<VectorIndex>,
}

/// In-process search over a [`MemoryRepository`].
///
/// Memories without a stored embedding are embedded on the fly (and not
/// persisted; that is the backfill job's work). The HNSW index is rebuilt
/// when the active memory set changes.
pub struct LocalSimilaritySearch {
    repo: MemoryRepository,
    embedder: Arc<dyn EmbeddingProvider>,
    brute_force_threshold: usize,
    state: Mutex<IndexState>,
}

impl std::fmt::Debug for LocalSimilaritySearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSimilaritySearch")
            .field("model", &self.embedder.model_name())
            .field("brute_force_threshold", &self.brute_force_threshold)
            .finish_non_exhaustive()
    }
}

impl LocalSimilaritySearch {
    /// Search over `repo` using `embedder` for queries and missing vectors.
    #[must_use]
    pub fn new(repo: MemoryRepository, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            repo,
            embedder,
            brute_force_threshold: DEFAULT_BRUTE_FORCE_THRESHOLD,
            state: Mutex::new(IndexState {
                fingerprint: None,
                index: Arc::new(VectorIndex::empty()),
            }),
        }
    }

    /// Override the corpus size at which the HNSW graph is used.
    #[must_use]
    pub fn with_brute_force_threshold(mut self, threshold: usize) -> Self {
        self.brute_force_threshold = threshold;
        self
    }

    async fn current_index(&self, active: &[Memory]) -> Result<Arc<VectorIndex>> {
        let fingerprint = fingerprint(active);
        {
            let state = self.state.lock();
            if state.fingerprint == Some(fingerprint) {
                return Ok(Arc::clone(&state.index));
            }
        }

        let missing: Vec<String> = active
            .iter()
            .filter(|m| m.embedding.is_none())
            .map(|m| m.content.clone())
            .collect();
        let mut computed = self.embedder.embed_batch(&missing).await?.into_iter();
        let mut vectors: Vec<(MemoryId, Embedding)> = Vec::with_capacity(active.len());
        for m in active {
            let e = match &m.embedding {
                Some(e) => e.clone(),
                None => match computed.next() {
                    Some(e) => e,
                    None => continue,
                },
            };
            vectors.push((m.id, e));
        }

        let index = Arc::new(VectorIndex::build(
            vectors.iter().map(|(id, e)| (*id, e)),
            self.brute_force_threshold,
        ));
        tracing::debug!(points = index.len(), graph = index.uses_graph(), "similarity index rebuilt");
        let mut state = self.state.lock();
        state.fingerprint = Some(fingerprint);
        state.index = Arc::clone(&index);
        Ok(index)
    }
}

fn fingerprint(active: &[Memory]) -> Fingerprint {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    for m in active {
        m.id.hash(&mut h);
    }
    (active.len(), active.iter().map(|m| m.updated_at).max(), h.finish())
}

#[async_trait]
impl SimilaritySearch for LocalSimilaritySearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredMemory>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let active = self.repo.list_active().await?;
        let index = self.current_index(&active).await?;
        let q = match &query.embedding {
            Some(e) => e.clone(),
            None => self.embedder.embed(&query.text).await?,
        };

        let by_id: HashMap<MemoryId, &Memory> = active.iter().map(|m| (m.id, m)).collect();
        // Over-fetch so post-filters still leave `limit` results.
        let fetch = if index.uses_graph() { query.limit.saturating_mul(4) } else { index.len() };
        let results: Vec<ScoredMemory> = index
            .search(&q, fetch)
            .into_iter()
            .filter_map(|n| by_id.get(&n.memory_id).map(|m| (*m, n.similarity)))
            .filter(|(m, sim)| query.accepts(m) && *sim >= query.min_similarity)
            .take(query.limit)
            .map(|(m, sim)| ScoredMemory::new(m.clone(), sim))
            .collect();
        tracing::debug!(results = results.len(), "local similarity search");
        Ok(results)
    }
}
