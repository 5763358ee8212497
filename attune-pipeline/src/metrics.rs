//! Runtime counters for the request path and batch jobs.
//!
//! Lock-free `AtomicU64` counters incremented in the hot path and read on
//! export. Relaxed ordering: counters are independent and only need to be
//! eventually visible.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline counters since startup.
#[derive(Debug)]
pub struct PipelineMetrics {
    /// Context requests handled.
    pub requests: AtomicU64,
    /// Stages skipped across all requests.
    pub stages_skipped: AtomicU64,
    /// Surprise scores served from cache.
    pub surprise_cache_hits: AtomicU64,
    /// Surprise scores computed by probing.
    pub surprise_cache_misses: AtomicU64,
    /// Surprise probe pairs that failed.
    pub probe_failures: AtomicU64,
    /// Conflicts resolved by consolidation.
    pub conflicts_resolved: AtomicU64,
    /// Consolidation writes that landed partially.
    pub partial_resolutions: AtomicU64,
    /// Embeddings written by backfill.
    pub embeddings_backfilled: AtomicU64,
}

impl PipelineMetrics {
    /// Zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            stages_skipped: AtomicU64::new(0),
            surprise_cache_hits: AtomicU64::new(0),
            surprise_cache_misses: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
            partial_resolutions: AtomicU64::new(0),
            embeddings_backfilled: AtomicU64::new(0),
        }
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Add one to a counter.
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: load(&self.requests),
            stages_skipped: load(&self.stages_skipped),
            surprise_cache_hits: load(&self.surprise_cache_hits),
            surprise_cache_misses: load(&self.surprise_cache_misses),
            probe_failures: load(&self.probe_failures),
            conflicts_resolved: load(&self.conflicts_resolved),
            partial_resolutions: load(&self.partial_resolutions),
            embeddings_backfilled: load(&self.embeddings_backfilled),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Context requests handled.
    pub requests: u64,
    /// Stages skipped.
    pub stages_skipped: u64,
    /// Surprise cache hits.
    pub surprise_cache_hits: u64,
    /// Surprise cache misses.
    pub surprise_cache_misses: u64,
    /// Failed probe pairs.
    pub probe_failures: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Partial resolutions.
    pub partial_resolutions: u64,
    /// Embeddings backfilled.
    pub embeddings_backfilled: u64,
}

impl MetricsSnapshot {
    /// Surprise cache hit rate in [0, 1]; 0 when nothing was looked up.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn surprise_hit_rate(&self) -> f64 {
        let total = self.surprise_cache_hits + self.surprise_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.surprise_cache_hits as f64 / total as f64
        }
    }

    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows = [
            ("requests", "Context requests handled", self.requests),
            ("stages_skipped", "Pipeline stages skipped", self.stages_skipped),
            ("surprise_cache_hits", "Surprise scores served from cache", self.surprise_cache_hits),
            ("surprise_cache_misses", "Surprise scores computed", self.surprise_cache_misses),
            ("probe_failures", "Failed surprise probe pairs", self.probe_failures),
            ("conflicts_resolved", "Conflicts resolved by consolidation", self.conflicts_resolved),
            ("partial_resolutions", "Partially applied consolidation writes", self.partial_resolutions),
            ("embeddings_backfilled", "Embeddings written by backfill", self.embeddings_backfilled),
        ];
        rows.iter()
            .map(|(name, help, value)| {
                format!("# HELP attune_{name}_total {help}\n# TYPE attune_{name}_total counter\nattune_{name}_total {value}\n")
            })
            .collect()
    }
}
