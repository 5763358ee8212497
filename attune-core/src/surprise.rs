//! Information-theoretic surprise: next-token distributions, KL divergence
//! and the TTL cache for scores.
//!
//! A memory's surprise score is `KL(P‖Q)` in bits, where `P` is the first
//! token distribution with the memory in context and `Q` the baseline
//! without it. Fetching the distributions lives in `attune-pipeline`; this
//! module holds the pure math and the cache.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::types::MemoryId;

/// Mass substituted for tokens present in `P` but missing from `Q`.
pub const KL_EPSILON: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Distributions
// ---------------------------------------------------------------------------

/// A normalised probability distribution over first tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenDistribution {
    probs: HashMap<String, f64>,
}

impl TokenDistribution {
    /// Build from `(token, logprob)` pairs as returned by a provider.
    ///
    /// Log-probabilities are exponentiated and renormalised to sum to 1,
    /// since a top-K slice never sums exactly to 1. Duplicate tokens are
    /// merged. Non-finite entries are dropped.
    #[must_use]
    pub fn from_logprobs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut probs: HashMap<String, f64> = HashMap::new();
        for (token, logprob) in pairs {
            let p = logprob.exp();
            if p.is_finite() && p > 0.0 {
                *probs.entry(token.to_string()).or_default() += p;
            }
        }
        Self::normalized(probs)
    }

    /// Build from raw (possibly unnormalised) probabilities.
    #[must_use]
    pub fn from_probs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut probs: HashMap<String, f64> = HashMap::new();
        for (token, p) in pairs {
            if p.is_finite() && p > 0.0 {
                *probs.entry(token.to_string()).or_default() += p;
            }
        }
        Self::normalized(probs)
    }

    fn normalized(mut probs: HashMap<String, f64>) -> Self {
        let total: f64 = probs.values().sum();
        if total > 0.0 {
            for p in probs.values_mut() {
                *p /= total;
            }
        }
        Self { probs }
    }

    /// Probability of a token (0 if absent).
    #[must_use]
    pub fn prob(&self, token: &str) -> f64 {
        self.probs.get(token).copied().unwrap_or(0.0)
    }

    /// Number of tokens with non-zero mass.
    #[must_use]
    pub fn len(&self) -> usize {
        self.probs.len()
    }

    /// Whether the distribution is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Iterate over `(token, probability)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.probs.iter().map(|(t, p)| (t.as_str(), *p))
    }
}

/// Asymmetric KL divergence `KL(P‖Q) = Σ P(t)·log2(P(t)/Q(t))`, in bits.
///
/// Tokens with `P(t) <= 0` contribute nothing. Tokens missing from `Q` use
/// [`KL_EPSILON`]. The result is never negative: rounding noise below zero
/// is clamped, so `KL(P‖P) == 0` exactly.
#[must_use]
pub fn kl_divergence(p: &TokenDistribution, q: &TokenDistribution) -> f64 {
    let kl: f64 = p
        .iter()
        .filter(|(_, pt)| *pt > 0.0)
        .map(|(token, pt)| {
            let qt = q.prob(token);
            let qt = if qt > 0.0 { qt } else { KL_EPSILON };
            pt * (pt / qt).log2()
        })
        .sum();
    if kl.is_finite() { kl.max(0.0) } else { 0.0 }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Receiver of "everything derived from memory content is stale" signals.
///
/// The pipeline fans consolidation events out to every registered sink; the
/// transport that delivers external signals is up to the host.
pub trait InvalidationSink: Send + Sync {
    /// Drop all derived state.
    fn invalidate_all(&self);
}

/// Hash of the triggering user message, used as half of the cache key.
#[must_use]
pub fn context_hash(message: &str) -> u64 {
    let mut h = DefaultHasher::new();
    message.hash(&mut h);
    h.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    memory: MemoryId,
    context: u64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    score: f64,
    written_at: Instant,
}

/// Counters for cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned a live score.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Full invalidations.
    pub invalidations: u64,
    /// Entries currently held (including not-yet-swept expired ones).
    pub entries: usize,
}

/// Process-wide surprise score cache.
///
/// Keyed by `(memory id, context hash)`. Entries expire after a fixed TTL
/// or on [`invalidate_all`](InvalidationSink::invalidate_all). An LRU hard
/// capacity bounds memory; the soft cleanup sweep of expired entries runs
/// on insert once the size passes `cleanup_threshold`.
///
/// A generation counter is bumped on every invalidation. Callers that
/// compute a score asynchronously should capture [`generation`](Self::generation)
/// before the call and store with [`insert_if_generation`](Self::insert_if_generation),
/// so a score computed against pre-invalidation content is discarded.
pub struct SurpriseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
    cleanup_threshold: usize,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl std::fmt::Debug for SurpriseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurpriseCache")
            .field("ttl", &self.ttl)
            .field("cleanup_threshold", &self.cleanup_threshold)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SurpriseCache {
    /// Default entry lifetime.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    /// Create a cache on the system clock.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize, cleanup_threshold: usize) -> Self {
        Self::with_clock(ttl, capacity, cleanup_threshold, Arc::new(SystemClock))
    }

    /// Create a cache with an injected clock.
    #[must_use]
    pub fn with_clock(
        ttl: Duration,
        capacity: usize,
        cleanup_threshold: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            cleanup_threshold,
            clock,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Build from the `[surprise]` config section.
    #[must_use]
    pub fn from_config(config: &crate::config::SurpriseConfig) -> Self {
        Self::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
            config.cleanup_threshold,
        )
    }

    /// Look up a live score. Expired entries are removed on read.
    #[must_use]
    pub fn get(&self, memory: MemoryId, context: u64) -> Option<f64> {
        let key = CacheKey { memory, context };
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let state = entries
            .get(&key)
            .map(|e| (e.score, now.duration_since(e.written_at) < self.ttl));
        let found = match state {
            Some((score, true)) => Some(score),
            Some((_, false)) => {
                entries.pop(&key);
                None
            }
            None => None,
        };
        drop(entries);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a score unconditionally.
    pub fn insert(&self, memory: MemoryId, context: u64, score: f64) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.put(
            CacheKey { memory, context },
            CacheEntry {
                score,
                written_at: now,
            },
        );
        if entries.len() > self.cleanup_threshold {
            Self::sweep_expired(&mut entries, now, self.ttl);
        }
    }

    /// Store a score only if no invalidation happened since `generation`
    /// was read. Returns whether the score was stored.
    pub fn insert_if_generation(&self, generation: u64, memory: MemoryId, context: u64, score: f64) -> bool {
        // Checked under the entries lock: invalidate_all bumps the
        // generation while holding the same lock.
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.put(
            CacheKey { memory, context },
            CacheEntry {
                score,
                written_at: now,
            },
        );
        if entries.len() > self.cleanup_threshold {
            Self::sweep_expired(&mut entries, now, self.ttl);
        }
        true
    }

    /// Current invalidation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        Self::sweep_expired(&mut self.entries.lock(), now, self.ttl)
    }

    /// Number of held entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn sweep_expired(entries: &mut LruCache<CacheKey, CacheEntry>, now: Instant, ttl: Duration) -> usize {
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.written_at) >= ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "swept expired surprise scores");
        }
        expired.len()
    }
}

impl Default for SurpriseCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, 1000, 200)
    }
}

impl InvalidationSink for SurpriseCache {
    fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let cleared = entries.len();
        entries.clear();
        drop(entries);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cleared, "surprise cache invalidated");
    }
}
