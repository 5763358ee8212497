//! Approximate nearest-neighbor index over memory embeddings.
//!
//! Wraps `instant-distance` HNSW. The graph is immutable once built, so
//! the index is rebuilt wholesale from a snapshot of embeddings whenever
//! the memory set changes. Small corpora skip the graph and scan linearly.

use instant_distance::{Builder, HnswMap, Point, Search};

use crate::types::{Embedding, MemoryId};

/// Below this many points, search is a linear scan.
pub const DEFAULT_BRUTE_FORCE_THRESHOLD: usize = 100;

#[derive(Clone, Debug)]
struct UnitPoint(Vec<f32>);

impl UnitPoint {
    fn new(embedding: &Embedding) -> Self {
        let norm = embedding.0.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        Self(embedding.0.iter().map(|x| x / norm).collect())
    }

    fn similarity(&self, other: &Self) -> f32 {
        if self.0.len() != other.0.len() {
            return 0.0;
        }
        self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum()
    }
}

impl Point for UnitPoint {
    /// Cosine distance on pre-normalised vectors.
    fn distance(&self, other: &Self) -> f32 {
        (1.0 - self.similarity(other)).max(0.0)
    }
}

/// One neighbor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// The memory.
    pub memory_id: MemoryId,
    /// Cosine similarity to the query.
    pub similarity: f32,
}

/// HNSW index with a linear-scan fallback.
pub struct VectorIndex {
    points: Vec<UnitPoint>,
    ids: Vec<MemoryId>,
    graph: Option<HnswMap<UnitPoint, MemoryId>>,
    ef_construction: usize,
    ef_search: usize,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("points", &self.points.len())
            .field("graph", &self.graph.is_some())
            .finish_non_exhaustive()
    }
}

impl VectorIndex {
    /// Build an index over `entries`. The HNSW graph is only built when
    /// there are at least `brute_force_threshold` entries.
    #[must_use]
    pub fn build<'a, I>(entries: I, brute_force_threshold: usize) -> Self
    where
        I: IntoIterator<Item = (MemoryId, &'a Embedding)>,
    {
        let (ids, points): (Vec<MemoryId>, Vec<UnitPoint>) =
            entries.into_iter().map(|(id, e)| (id, UnitPoint::new(e))).unzip();
        let mut index = Self {
            points,
            ids,
            graph: None,
            ef_construction: 100,
            ef_search: 50,
        };
        if index.points.len() >= brute_force_threshold && !index.points.is_empty() {
            let graph = Builder::default()
                .ef_construction(index.ef_construction)
                .ef_search(index.ef_search)
                .seed(42)
                .build(index.points.clone(), index.ids.clone());
            index.graph = Some(graph);
        }
        index
    }

    /// An empty index.
    #[must_use]
    pub fn empty() -> Self {
        Self::build(std::iter::empty(), DEFAULT_BRUTE_FORCE_THRESHOLD)
    }

    /// Number of indexed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the index holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether searches go through the HNSW graph.
    #[must_use]
    pub fn uses_graph(&self) -> bool {
        self.graph.is_some()
    }

    /// The `k` nearest neighbors, most similar first.
    #[must_use]
    pub fn search(&self, query: &Embedding, k: usize) -> Vec<Neighbor> {
        let q = UnitPoint::new(query);
        if let Some(graph) = &self.graph {
            let mut search = Search::default();
            return graph
                .search(&q, &mut search)
                .take(k)
                .map(|item| Neighbor {
                    memory_id: *item.value,
                    similarity: 1.0 - item.distance,
                })
                .collect();
        }
        let mut scored: Vec<Neighbor> = self
            .points
            .iter()
            .zip(&self.ids)
            .map(|(p, id)| Neighbor {
                memory_id: *id,
                similarity: q.similarity(p),
            })
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        scored
    }
}
