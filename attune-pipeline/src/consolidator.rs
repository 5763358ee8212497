//! Memory consolidation: detect and resolve contradictions.
//!
//! ```text
//! candidate ──► similarity search ──► LLM conflict analysis ──► verdict
//!                                                                 │
//!            no conflict: leave the candidate untouched ◄─────────┤
//!                                                                 ▼
//!   write consolidated record + invalidate conflicting ids + outdate candidate
//!                       (one unit; partial = error)
//!                                  │
//!                                  ▼
//!               notify invalidation sinks, record event
//! ```
//!
//! Runs out of band. Live requests may read a memory while it is being
//! retired; the worst case is one turn using a stale memory.

use std::collections::HashSet;
use std::sync::Arc;

use attune_core::config::ConsolidationConfig;
use attune_core::repository::{MemoryRepository, ResolutionReceipt, ResolutionWrite};
use attune_core::search::{SearchQuery, SimilaritySearch};
use attune_core::surprise::InvalidationSink;
use attune_core::types::{Memory, MemoryId, ScoredMemory, ValidationState};
use attune_llm::prompt::{PromptEngine, PromptId};
use attune_llm::ratelimit::RateLimitBudget;
use attune_llm::types::parse_structured;
use attune_llm::{CompletionBackend, ConflictAnalysis, JsonRequest, RetryPolicy, with_retry};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::invalidation::CONSOLIDATION_EVENT_KEY;
use crate::metrics::PipelineMetrics;

/// A candidate with its analysed verdict.
#[derive(Debug, Clone)]
pub struct ConflictCheck {
    /// The memory that was checked.
    pub candidate: Memory,
    /// Provider verdict as returned.
    pub analysis: ConflictAnalysis,
    /// Conflicting ids, restricted to the memories actually shown to the
    /// provider.
    pub conflicting: Vec<MemoryId>,
}

impl ConflictCheck {
    fn clean(candidate: Memory, explanation: &str) -> Self {
        Self {
            candidate,
            analysis: ConflictAnalysis::no_conflict(explanation),
            conflicting: Vec::new(),
        }
    }

    /// Whether there is anything to resolve.
    #[must_use]
    pub fn has_conflict(&self) -> bool {
        self.analysis.has_conflict && !self.conflicting.is_empty()
    }
}

/// Progress of a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    /// Candidates finished so far.
    pub processed: usize,
    /// Candidates in this scan.
    pub total: usize,
    /// Conflicts resolved so far.
    pub resolved: usize,
}

/// Outcome of [`MemoryConsolidator::scan_and_consolidate`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Candidates fetched.
    pub scanned: usize,
    /// Conflicts resolved.
    pub resolved: usize,
    /// Candidates with nothing to resolve.
    pub clean: usize,
    /// Candidates already retired by an earlier resolution in this scan.
    pub skipped: usize,
    /// Candidates whose writes landed partially.
    pub partial: usize,
    /// Failed candidates with the reason.
    pub failed: Vec<(MemoryId, String)>,
}

enum Outcome {
    Resolved,
    Clean,
    Skipped,
    Failed(MemoryId, PipelineError),
}

/// Checks candidates against stored memories and applies resolutions.
pub struct MemoryConsolidator {
    repo: MemoryRepository,
    search: Arc<dyn SimilaritySearch>,
    backend: Arc<dyn CompletionBackend>,
    prompts: Arc<PromptEngine>,
    policy: RetryPolicy,
    budget: Arc<RateLimitBudget>,
    config: ConsolidationConfig,
    sinks: Vec<Arc<dyn InvalidationSink>>,
    metrics: Arc<PipelineMetrics>,
}

impl std::fmt::Debug for MemoryConsolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConsolidator")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl MemoryConsolidator {
    /// Consolidator over `repo`, finding neighbours with `search` and
    /// analysing with `backend`.
    #[must_use]
    pub fn new(
        repo: MemoryRepository,
        search: Arc<dyn SimilaritySearch>,
        backend: Arc<dyn CompletionBackend>,
        policy: RetryPolicy,
        config: ConsolidationConfig,
    ) -> Self {
        let budget = Arc::new(RateLimitBudget::per_minute(config.requests_per_minute, config.burst));
        Self {
            repo,
            search,
            backend,
            prompts: Arc::new(PromptEngine::builtin()),
            policy,
            budget,
            config,
            sinks: Vec::new(),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Notify `sink` after every successful resolution.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn InvalidationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Use custom prompt templates.
    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<PromptEngine>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Share a rate-limit budget with other jobs.
    #[must_use]
    pub fn with_budget(mut self, budget: Arc<RateLimitBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Report into shared counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Ask the provider whether `candidate` contradicts similar memories.
    ///
    /// No provider call is made when there are no neighbours. Ids the
    /// provider invents (not among the neighbours shown) are dropped.
    ///
    /// # Errors
    /// Search failures, provider failures after retries, and malformed or
    /// inconsistent verdicts.
    pub async fn check_conflicts(&self, candidate: &Memory) -> Result<ConflictCheck> {
        let query = SearchQuery::new(candidate.content.clone(), self.config.search_limit.saturating_add(1))
            .with_min_similarity(self.config.min_similarity);
        let neighbors: Vec<ScoredMemory> = self
            .search
            .search(&query)
            .await?
            .into_iter()
            .filter(|n| n.memory.id != candidate.id && !n.memory.validation.is_retired())
            .take(self.config.search_limit)
            .collect();
        if neighbors.is_empty() {
            debug!(memory_id = %candidate.id, "no neighbours, nothing to check");
            return Ok(ConflictCheck::clean(candidate.clone(), "no similar memories"));
        }

        let existing = neighbors
            .iter()
            .map(|n| format!("- {}: {}", n.memory.id, n.memory.content))
            .collect::<Vec<_>>()
            .join("\n");
        let (system, user) = self.prompts.render(
            PromptId::ConflictAnalysis,
            &[("candidate", candidate.content.as_str()), ("existing_memories", existing.as_str())],
        )?;
        let max_tokens = self.prompts.get(PromptId::ConflictAnalysis).map_or(500, |t| t.max_tokens);
        let request = JsonRequest::new(system, user).with_max_tokens(max_tokens);

        self.budget.acquire().await;
        let raw = with_retry(&self.policy, "conflict_analysis", || self.backend.complete_json(&request)).await?;
        let analysis: ConflictAnalysis = parse_structured(&raw)?;
        analysis.validate()?;

        let shown: HashSet<MemoryId> = neighbors.iter().map(|n| n.memory.id).collect();
        let mut conflicting: Vec<MemoryId> = Vec::new();
        for raw_id in &analysis.conflicting_ids {
            match MemoryId::parse(raw_id.trim()) {
                Some(id) if shown.contains(&id) => {
                    if !conflicting.contains(&id) {
                        conflicting.push(id);
                    }
                }
                _ => warn!(memory_id = %candidate.id, id = %raw_id, "provider named an id it was not shown, ignoring"),
            }
        }
        if analysis.has_conflict && conflicting.is_empty() {
            warn!(memory_id = %candidate.id, "conflict reported without any known id, treating as clean");
        }
        debug!(
            memory_id = %candidate.id,
            has_conflict = analysis.has_conflict,
            conflicting = conflicting.len(),
            "conflict analysis done"
        );
        Ok(ConflictCheck {
            candidate: candidate.clone(),
            analysis,
            conflicting,
        })
    }

    /// Apply a verdict: write the consolidated record, invalidate every
    /// conflicting id and retire the candidate as outdated, as one unit.
    ///
    /// Returns `None` when there is nothing to resolve.
    ///
    /// # Errors
    /// `AttuneError::PartialResolution` (wrapped) when the unit landed
    /// partially; lifecycle and storage errors otherwise.
    pub async fn apply_resolution(&self, check: &ConflictCheck) -> Result<Option<ResolutionReceipt>> {
        if !check.has_conflict() {
            return Ok(None);
        }
        let now = Utc::now();
        let candidate = &check.candidate;
        let mut record = Memory::new(
            check.analysis.consolidated_content.trim(),
            candidate.category,
            candidate.domain,
            candidate.heat,
            now,
        )
        .with_validation(ValidationState::Consolidated)
        .with_durability(candidate.durability);
        record.emotion = candidate.emotion;

        let write = ResolutionWrite {
            new_record: record,
            invalidate: check.conflicting.clone(),
            outdate: (!check.conflicting.contains(&candidate.id)).then_some(candidate.id),
        };
        let receipt = match self.repo.apply_resolution(write, now).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let e = PipelineError::from(e);
                if e.is_partial_resolution() {
                    PipelineMetrics::incr(&self.metrics.partial_resolutions);
                }
                return Err(e);
            }
        };

        for sink in &self.sinks {
            sink.invalidate_all();
        }
        let event = json!({
            "at": now,
            "new_record": receipt.new_record,
            "invalidated": receipt.invalidated,
            "outdated": receipt.outdated,
            "resolution_type": check.analysis.resolution_type,
        });
        if let Err(e) = self.repo.store().set(CONSOLIDATION_EVENT_KEY, event).await {
            warn!(error = %e, "failed to record consolidation event");
        }
        PipelineMetrics::incr(&self.metrics.conflicts_resolved);
        info!(
            memory_id = %candidate.id,
            new_record = %receipt.new_record,
            invalidated = receipt.invalidated.len(),
            resolution = ?check.analysis.resolution_type,
            "conflict resolved"
        );
        Ok(Some(receipt))
    }

    /// Check and resolve up to `limit` provisional memories.
    ///
    /// Candidates run with bounded concurrency (`max_concurrency`), each
    /// provider call paced by the rate-limit budget. One candidate's
    /// failure is recorded and the scan continues. `progress` is called
    /// after every candidate.
    ///
    /// # Errors
    /// Only if the candidate list cannot be read.
    pub async fn scan_and_consolidate(
        &self,
        limit: usize,
        progress: Option<&(dyn Fn(ScanProgress) + Send + Sync)>,
    ) -> Result<ScanReport> {
        let candidates = self.repo.list_by_state(ValidationState::Provisional, limit).await?;
        let total = candidates.len();
        info!(candidates = total, "consolidation scan started");

        let mut report = ScanReport {
            scanned: total,
            ..ScanReport::default()
        };
        let mut outcomes = futures::stream::iter(candidates)
            .map(|candidate| self.process(candidate))
            .buffer_unordered(self.config.max_concurrency.max(1));

        let mut processed = 0;
        while let Some(outcome) = outcomes.next().await {
            processed += 1;
            match outcome {
                Outcome::Resolved => report.resolved += 1,
                Outcome::Clean => report.clean += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed(id, e) => {
                    if e.is_partial_resolution() {
                        report.partial += 1;
                    }
                    warn!(memory_id = %id, error = %e, "candidate failed, continuing");
                    report.failed.push((id, e.to_string()));
                }
            }
            if let Some(callback) = progress {
                callback(ScanProgress {
                    processed,
                    total,
                    resolved: report.resolved,
                });
            }
        }

        info!(
            scanned = report.scanned,
            resolved = report.resolved,
            failed = report.failed.len(),
            "consolidation scan finished"
        );
        Ok(report)
    }

    async fn process(&self, candidate: Memory) -> Outcome {
        // An earlier resolution in this scan may have retired it.
        let current = match self.repo.get(candidate.id).await {
            Ok(Some(m)) if !m.validation.is_retired() => m,
            Ok(_) => return Outcome::Skipped,
            Err(e) => return Outcome::Failed(candidate.id, e.into()),
        };
        let check = match self.check_conflicts(&current).await {
            Ok(check) => check,
            Err(e) => return Outcome::Failed(current.id, e),
        };
        match self.apply_resolution(&check).await {
            Ok(Some(_)) => Outcome::Resolved,
            Ok(None) => Outcome::Clean,
            Err(e) => Outcome::Failed(current.id, e),
        }
    }
}
