//! The per-request context pipeline.
//!
//! ```text
//!             message + recent turns
//!                       │
//!      ┌────────────────┼─────────────────┐
//!      ▼                ▼                 ▼
//!    heat            affect     goal ∥ similarity search
//!                                         │
//!                                         ▼
//!                                 memory inhibition
//!                                         │
//!                                         ▼
//!                            pattern scout, surprise re-rank
//!                                         │
//!      opspec routing ──────────► compose ◄┘
//!                                   │
//!                                   ▼
//!                              context block
//! ```
//!
//! [`ContextPipeline::build_context`] is infallible: every failure degrades
//! the block and is listed in [`ContextResult::skipped`], so the user's
//! message is never held back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use attune_core::affect::{AffectReading, detect_affect};
use attune_core::compose::{ContextParts, compose, prefix_message};
use attune_core::config::AttuneConfig;
use attune_core::goal::{DisabledGoalExtractor, Goal, GoalExtractor};
use attune_core::heat::{HeatDetector, HeatReading};
use attune_core::inhibition::{InhibitionEntry, MemoryInhibitor};
use attune_core::opspec::{OpSpecRouter, RoutedOpSpec};
use attune_core::patterns::{PatternMatch, PatternScout};
use attune_core::repository::MemoryRepository;
use attune_core::search::{SearchQuery, SimilaritySearch};
use attune_core::surprise::InvalidationSink;
use attune_core::types::{ConversationTurn, MemoryId, ScoredMemory};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::PipelineMetrics;
use crate::surprise::{SurpriseScorer, rerank};

/// A stage that did not contribute to this request's block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageSkip {
    /// Injection is turned off in configuration.
    Disabled,
    /// The message was empty.
    EmptyMessage,
    /// Similarity search failed; no memories were surfaced.
    Search {
        /// Failure description.
        reason: String,
    },
    /// A provider-backed stage needs an API key.
    MissingCredential {
        /// The stage that was skipped.
        feature: String,
    },
    /// Some surprise probes failed; those memories kept their similarity rank.
    Surprise {
        /// Memories without a score.
        failed: usize,
    },
    /// Access bookkeeping could not be written.
    RecordAccess {
        /// Failure description.
        reason: String,
    },
}

/// Everything a request produced.
#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    /// The composed block; may be empty.
    pub block: String,
    /// Message heat.
    pub heat: HeatReading,
    /// Message affect and its complement.
    pub affect: AffectReading,
    /// Extracted goal.
    pub goal: Goal,
    /// Memories surfaced, in final order.
    pub memories: Vec<ScoredMemory>,
    /// Candidates dropped by inhibition.
    pub inhibited_count: usize,
    /// Whether inhibition ignored the goal.
    pub fail_open: bool,
    /// Inhibition audit trail, when enabled.
    pub inhibition_report: Option<Vec<InhibitionEntry>>,
    /// Detected behavioral patterns.
    pub patterns: Vec<PatternMatch>,
    /// Routed instruction modules.
    pub opspec: RoutedOpSpec,
    /// Surprise scores in bits, by memory.
    pub surprise: HashMap<MemoryId, f64>,
    /// Stages that did not contribute.
    pub skipped: Vec<StageSkip>,
}

impl ContextResult {
    fn empty(message: &str, skip: StageSkip) -> Self {
        Self {
            block: String::new(),
            heat: HeatDetector::new().detect(message),
            affect: detect_affect(message),
            goal: Goal::unclear(),
            memories: Vec::new(),
            inhibited_count: 0,
            fail_open: true,
            inhibition_report: None,
            patterns: Vec::new(),
            opspec: RoutedOpSpec::default(),
            surprise: HashMap::new(),
            skipped: vec![skip],
        }
    }
}

/// Builds the per-user context block for each outgoing message.
pub struct ContextPipeline {
    config: AttuneConfig,
    heat: HeatDetector,
    goals: Arc<dyn GoalExtractor>,
    search: Arc<dyn SimilaritySearch>,
    inhibitor: MemoryInhibitor,
    scout: PatternScout,
    surprise: Option<Arc<SurpriseScorer>>,
    router: Arc<OpSpecRouter>,
    repo: Option<MemoryRepository>,
    metrics: Arc<PipelineMetrics>,
}

impl std::fmt::Debug for ContextPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPipeline")
            .field("enabled", &self.config.general.enabled)
            .field("surprise", &self.surprise.is_some())
            .field("opspec_modules", &self.router.len())
            .finish_non_exhaustive()
    }
}

impl ContextPipeline {
    /// Pipeline over `search` with goal extraction disabled, no surprise
    /// scoring and the built-in OpSpec catalog.
    #[must_use]
    pub fn new(config: AttuneConfig, search: Arc<dyn SimilaritySearch>) -> Self {
        Self {
            heat: HeatDetector::new(),
            goals: Arc::new(DisabledGoalExtractor),
            search,
            inhibitor: MemoryInhibitor::new(config.inhibition.clone()),
            scout: PatternScout::new(config.patterns.clone()),
            surprise: None,
            router: Arc::new(OpSpecRouter::with_default_catalog()),
            repo: None,
            metrics: Arc::new(PipelineMetrics::new()),
            config,
        }
    }

    /// Use `extractor` for goals.
    #[must_use]
    pub fn with_goal_extractor(mut self, extractor: Arc<dyn GoalExtractor>) -> Self {
        self.goals = extractor;
        self
    }

    /// Re-rank by surprise (when enabled in configuration).
    #[must_use]
    pub fn with_surprise(mut self, scorer: Arc<SurpriseScorer>) -> Self {
        self.surprise = Some(scorer);
        self
    }

    /// Share an OpSpec router (e.g. one kept fresh by the invalidation listener).
    #[must_use]
    pub fn with_router(mut self, router: Arc<OpSpecRouter>) -> Self {
        self.router = router;
        self
    }

    /// Record access counts on surfaced memories.
    #[must_use]
    pub fn with_repository(mut self, repo: MemoryRepository) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Report into shared counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Handler for an external invalidation signal: clears cached surprise
    /// scores. Safe to call at any time.
    pub fn invalidate(&self) {
        if let Some(scorer) = &self.surprise {
            scorer.cache().invalidate_all();
        }
    }

    /// Build the context block for `message`.
    pub async fn build_context(&self, message: &str, recent_turns: &[ConversationTurn]) -> ContextResult {
        PipelineMetrics::incr(&self.metrics.requests);
        let result = self.run(message, recent_turns).await;
        if !result.skipped.is_empty() {
            PipelineMetrics::add(&self.metrics.stages_skipped, result.skipped.len() as u64);
        }
        debug!(
            heat = result.heat.score,
            goal = %result.goal.goal_type,
            memories = result.memories.len(),
            inhibited = result.inhibited_count,
            patterns = result.patterns.len(),
            skipped = result.skipped.len(),
            block_len = result.block.len(),
            "context built"
        );
        result
    }

    /// `message` prefixed with its context block (unchanged when the block is empty).
    pub async fn inject(&self, message: &str, recent_turns: &[ConversationTurn]) -> String {
        let result = self.build_context(message, recent_turns).await;
        prefix_message(&result.block, message)
    }

    async fn run(&self, message: &str, recent_turns: &[ConversationTurn]) -> ContextResult {
        if !self.config.general.enabled {
            return ContextResult::empty(message, StageSkip::Disabled);
        }
        if message.trim().is_empty() {
            return ContextResult::empty(message, StageSkip::EmptyMessage);
        }
        let mut skipped = Vec::new();

        let heat = self.heat.detect(message);
        let affect = detect_affect(message);

        let keep = self.config.general.recent_turns;
        let turns = &recent_turns[recent_turns.len().saturating_sub(keep)..];
        let query = SearchQuery::new(message, self.config.general.candidate_limit);
        let (goal, candidates) = tokio::join!(self.goals.extract(message, turns), self.search.search(&query));
        let candidates = candidates.unwrap_or_else(|e| {
            warn!(error = %e, "similarity search failed, continuing without memories");
            skipped.push(StageSkip::Search { reason: e.to_string() });
            Vec::new()
        });

        let outcome = self.inhibitor.inhibit(candidates, &goal);
        let patterns = self.scout.scout(&outcome.memories, message, Utc::now());

        let mut memories = outcome.memories;
        let mut surprise = HashMap::new();
        if let (Some(scorer), true) = (&self.surprise, self.config.surprise.enabled) {
            if !memories.is_empty() {
                let budget = Duration::from_millis(self.config.surprise.budget_ms);
                match tokio::time::timeout(budget, scorer.score_all(&memories, message)).await {
                    Ok(batch) => {
                        if batch.missing_credential {
                            skipped.push(StageSkip::MissingCredential {
                                feature: "surprise scoring".into(),
                            });
                        } else if batch.failures > 0 {
                            skipped.push(StageSkip::Surprise { failed: batch.failures });
                        }
                        memories = rerank(memories, &batch.scores, self.config.surprise.rerank_weight);
                        surprise = batch.scores;
                    }
                    Err(_) => {
                        warn!(
                            budget_ms = self.config.surprise.budget_ms,
                            memories = memories.len(),
                            "surprise stage over budget, keeping similarity order"
                        );
                        skipped.push(StageSkip::Surprise { failed: memories.len() });
                    }
                }
            }
        }

        let opspec = self.router.route(message);
        let block = compose(&ContextParts {
            opspec: &opspec.content,
            affect: Some(&affect.complement),
            goal: Some(&goal),
            patterns: &patterns,
            memories: &memories,
        });

        if let (Some(repo), false) = (&self.repo, memories.is_empty()) {
            let ids: Vec<MemoryId> = memories.iter().map(|m| m.memory.id).collect();
            if let Err(e) = repo.record_access(&ids, Utc::now()).await {
                warn!(error = %e, "failed to record memory access");
                skipped.push(StageSkip::RecordAccess { reason: e.to_string() });
            }
        }

        ContextResult {
            block,
            heat,
            affect,
            goal,
            memories,
            inhibited_count: outcome.inhibited_count,
            fail_open: outcome.fail_open,
            inhibition_report: outcome.report,
            patterns,
            opspec,
            surprise,
            skipped,
        }
    }
}
