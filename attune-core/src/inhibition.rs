//! Goal-based memory inhibition.
//!
//! Candidates from the similarity search are filtered by relevance to the
//! current [`Goal`]. With no usable goal (unclear, or confidence below the
//! configured floor) the inhibitor fails open: it keeps the top-N by
//! similarity and reports the rest as cut by the cap, not by the goal.
//!
//! With a usable goal, each candidate gets
//! `relevance = 0.6·domain_match + 0.4·min(1, keyword_hits / 2)`.
//! Candidates below `min_relevance` are inhibited, passing ones are capped,
//! and anything hotter than `high_heat_floor` is kept regardless.

use serde::Serialize;

use crate::config::InhibitionConfig;
use crate::goal::{Goal, GoalType};
use crate::types::{MemoryId, ScoredMemory};

const DOMAIN_WEIGHT: f32 = 0.6;
const KEYWORD_WEIGHT: f32 = 0.4;
const KEYWORD_SATURATION: f32 = 2.0;

/// Why a candidate was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InhibitionReason {
    /// Relevant enough, but beyond the memory cap.
    Cap,
    /// Not relevant to the current goal.
    GoalMismatch,
}

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition", content = "reason")]
pub enum Disposition {
    /// Passed through.
    Kept,
    /// Would have been inhibited; kept because of its heat.
    PreservedHighHeat,
    /// Dropped.
    Inhibited(InhibitionReason),
}

/// One line of the audit report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InhibitionEntry {
    /// The candidate.
    pub memory_id: MemoryId,
    /// Incoming similarity.
    pub similarity: f32,
    /// Goal relevance; `None` on the fail-open path.
    pub relevance: Option<f32>,
    /// Memory heat.
    pub heat: f32,
    /// Outcome.
    pub disposition: Disposition,
}

/// Result of [`MemoryInhibitor::inhibit`].
#[derive(Debug, Clone, Default)]
pub struct InhibitionOutcome {
    /// Surviving memories, highest similarity first.
    pub memories: Vec<ScoredMemory>,
    /// Number of candidates dropped.
    pub inhibited_count: usize,
    /// Whether the goal was ignored.
    pub fail_open: bool,
    /// Per-candidate audit trail, when enabled.
    pub report: Option<Vec<InhibitionEntry>>,
}

/// Filters candidate memories by relevance to the current goal.
#[derive(Debug, Clone, Default)]
pub struct MemoryInhibitor {
    config: InhibitionConfig,
}

impl MemoryInhibitor {
    /// Create an inhibitor from config.
    #[must_use]
    pub fn new(config: InhibitionConfig) -> Self {
        Self { config }
    }

    /// Whether `goal` is too weak to filter on.
    #[must_use]
    pub fn fails_open(&self, goal: &Goal) -> bool {
        goal.goal_type == GoalType::Unclear || goal.confidence < self.config.min_goal_confidence
    }

    /// Filter candidates against a goal.
    #[must_use]
    pub fn inhibit(&self, mut candidates: Vec<ScoredMemory>, goal: &Goal) -> InhibitionOutcome {
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        let fail_open = self.fails_open(goal);

        let decisions: Vec<(Option<f32>, Disposition)> = if fail_open {
            (0..candidates.len())
                .map(|rank| {
                    let d = if rank < self.config.max_memories {
                        Disposition::Kept
                    } else {
                        Disposition::Inhibited(InhibitionReason::Cap)
                    };
                    (None, d)
                })
                .collect()
        } else {
            let mut passed = 0_usize;
            candidates
                .iter()
                .map(|c| {
                    let relevance = goal_relevance(c, goal);
                    let natural = if relevance < self.config.min_relevance {
                        Disposition::Inhibited(InhibitionReason::GoalMismatch)
                    } else if passed < self.config.max_memories {
                        passed += 1;
                        Disposition::Kept
                    } else {
                        Disposition::Inhibited(InhibitionReason::Cap)
                    };
                    let d = match natural {
                        Disposition::Inhibited(_) if c.memory.heat > self.config.high_heat_floor => {
                            Disposition::PreservedHighHeat
                        }
                        other => other,
                    };
                    (Some(relevance), d)
                })
                .collect()
        };

        let report = self.config.emit_report.then(|| {
            candidates
                .iter()
                .zip(&decisions)
                .map(|(c, (relevance, disposition))| InhibitionEntry {
                    memory_id: c.memory.id,
                    similarity: c.similarity,
                    relevance: *relevance,
                    heat: c.memory.heat,
                    disposition: *disposition,
                })
                .collect()
        });

        let mut inhibited_count = 0;
        let memories: Vec<ScoredMemory> = candidates
            .into_iter()
            .zip(decisions)
            .filter_map(|(c, (_, d))| match d {
                Disposition::Inhibited(_) => {
                    inhibited_count += 1;
                    None
                }
                Disposition::Kept | Disposition::PreservedHighHeat => Some(c),
            })
            .collect();

        tracing::debug!(
            kept = memories.len(),
            inhibited = inhibited_count,
            fail_open,
            goal = %goal.goal_type,
            "memory inhibition"
        );

        InhibitionOutcome {
            memories,
            inhibited_count,
            fail_open,
            report,
        }
    }
}

/// Relevance of a candidate to the goal in [0, 1].
#[must_use]
pub fn goal_relevance(candidate: &ScoredMemory, goal: &Goal) -> f32 {
    let domain = if goal.domains.contains(&candidate.memory.domain) { 1.0 } else { 0.0 };
    let content = candidate.memory.content.to_lowercase();
    let hits = goal.keywords.iter().filter(|k| content.contains(k.as_str())).count();
    #[allow(clippy::cast_precision_loss)]
    let keyword = (hits as f32 / KEYWORD_SATURATION).min(1.0);
    DOMAIN_WEIGHT * domain + KEYWORD_WEIGHT * keyword
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LifeDomain, Memory, MemoryCategory};
    use chrono::Utc;

    fn cand(content: &str, domain: LifeDomain, heat: f32, sim: f32) -> ScoredMemory {
        ScoredMemory::new(
            Memory::new(content, MemoryCategory::Fact, domain, heat, Utc::now()),
            sim,
        )
    }

    fn work_goal(confidence: f32) -> Goal {
        Goal::new(GoalType::Decide, "job offer", confidence)
            .with_domains([LifeDomain::Work])
            .with_keywords(["offer", "salary"])
    }

    fn inhibitor(report: bool) -> MemoryInhibitor {
        MemoryInhibitor::new(InhibitionConfig {
            emit_report: report,
            ..InhibitionConfig::default()
        })
    }

    #[test]
    fn low_confidence_fails_open_by_similarity() {
        let cands = vec![
            cand("a", LifeDomain::Home, 0.1, 0.2),
            cand("b", LifeDomain::Home, 0.1, 0.9),
            cand("c", LifeDomain::Home, 0.1, 0.5),
            cand("d", LifeDomain::Home, 0.95, 0.1),
            cand("e", LifeDomain::Home, 0.1, 0.7),
        ];
        let out = inhibitor(true).inhibit(cands, &work_goal(0.2));
        assert!(out.fail_open);
        let contents: Vec<&str> = out.memories.iter().map(|m| m.memory.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "e", "c"]);
        assert_eq!(out.inhibited_count, 2);
        let report = out.report.expect("report enabled");
        assert!(
            report
                .iter()
                .filter(|e| matches!(e.disposition, Disposition::Inhibited(_)))
                .all(|e| e.disposition == Disposition::Inhibited(InhibitionReason::Cap))
        );
    }

    #[test]
    fn unclear_goal_fails_open_even_with_high_confidence() {
        let mut goal = Goal::unclear();
        goal.confidence = 0.9;
        let out = inhibitor(false).inhibit(vec![cand("a", LifeDomain::Work, 0.1, 0.5)], &goal);
        assert!(out.fail_open);
        assert_eq!(out.memories.len(), 1);
        assert!(out.report.is_none());
    }

    #[test]
    fn irrelevant_memories_are_inhibited_for_goal_mismatch() {
        let cands = vec![
            cand("The offer includes a higher salary", LifeDomain::Work, 0.3, 0.6),
            cand("Loves gardening on weekends", LifeDomain::Home, 0.3, 0.9),
        ];
        let out = inhibitor(true).inhibit(cands, &work_goal(0.8));
        assert!(!out.fail_open);
        assert_eq!(out.memories.len(), 1);
        assert!(out.memories[0].memory.content.contains("offer"));
        let report = out.report.expect("report");
        let garden = report.iter().find(|e| e.similarity > 0.8).expect("garden entry");
        assert_eq!(garden.disposition, Disposition::Inhibited(InhibitionReason::GoalMismatch));
    }

    #[test]
    fn high_heat_memory_survives_mismatch_and_cap() {
        let cands = vec![
            cand("work thing one", LifeDomain::Work, 0.2, 0.9),
            cand("work thing two", LifeDomain::Work, 0.2, 0.8),
            cand("work thing three", LifeDomain::Work, 0.2, 0.7),
            cand("work thing four", LifeDomain::Work, 0.2, 0.6),
            cand("Panic attacks after the accident", LifeDomain::Health, 0.9, 0.3),
        ];
        let out = inhibitor(true).inhibit(cands, &work_goal(0.8));
        assert_eq!(out.memories.len(), 4);
        assert_eq!(out.inhibited_count, 1);
        assert!(out.memories.iter().any(|m| m.memory.content.starts_with("Panic")));
        let report = out.report.expect("report");
        assert!(report.iter().any(|e| e.disposition == Disposition::PreservedHighHeat));
        assert!(
            report
                .iter()
                .any(|e| e.disposition == Disposition::Inhibited(InhibitionReason::Cap))
        );
    }

    #[test]
    fn relevance_combines_domain_and_keywords() {
        let goal = work_goal(0.8);
        let both = cand("offer and salary", LifeDomain::Work, 0.0, 0.5);
        let domain_only = cand("nothing", LifeDomain::Work, 0.0, 0.5);
        let one_keyword = cand("an offer", LifeDomain::Home, 0.0, 0.5);
        assert!((goal_relevance(&both, &goal) - 1.0).abs() < 1e-6);
        assert!((goal_relevance(&domain_only, &goal) - 0.6).abs() < 1e-6);
        assert!((goal_relevance(&one_keyword, &goal) - 0.2).abs() < 1e-6);
    }
}
