//! Assembly of the injected context block.
//!
//! Section order is fixed: OpSpec, affect guidance, pattern/goal guidance,
//! memory context. Empty sections are skipped.

use std::fmt::Write as _;

use crate::affect::AffectComplement;
use crate::goal::{Goal, GoalType};
use crate::patterns::PatternMatch;
use crate::types::ScoredMemory;

/// Inputs to [`compose`]. Everything is borrowed from the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextParts<'a> {
    /// Routed OpSpec text.
    pub opspec: &'a str,
    /// Affect complement, if any.
    pub affect: Option<&'a AffectComplement>,
    /// Current goal, if any.
    pub goal: Option<&'a Goal>,
    /// Detected patterns.
    pub patterns: &'a [PatternMatch],
    /// Memories to surface, already ranked.
    pub memories: &'a [ScoredMemory],
}

/// Render the goal and pattern guidance section.
#[must_use]
pub fn render_guidance(goal: Option<&Goal>, patterns: &[PatternMatch]) -> String {
    let mut out = String::new();
    if let Some(goal) = goal.filter(|g| g.goal_type != GoalType::Unclear) {
        let _ = writeln!(
            out,
            "Current goal: {} ({:.0}% confident).",
            goal.label,
            goal.confidence * 100.0
        );
    }
    for p in patterns {
        let _ = write!(
            out,
            "Pattern [{:?}, seen {}x]: {}. {}",
            p.confidence.level, p.instance_count, p.verb, p.application
        );
        if p.contradicted {
            out.push_str(" They may be breaking this pattern right now; notice it.");
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Render surfaced memories as a bullet list.
#[must_use]
pub fn render_memories(memories: &[ScoredMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("What you know about this user:");
    for m in memories {
        let _ = write!(out, "\n- [{}] {}", m.memory.domain, m.memory.content.trim());
    }
    out
}

/// Compose the full block. Returns an empty string when every section is empty.
#[must_use]
pub fn compose(parts: &ContextParts<'_>) -> String {
    let sections = [
        parts.opspec.trim().to_string(),
        parts.affect.map(|a| a.guidance.trim().to_string()).unwrap_or_default(),
        render_guidance(parts.goal, parts.patterns),
        render_memories(parts.memories),
    ];
    sections
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Prefix `message` with `block`. An empty block leaves the message unchanged.
#[must_use]
pub fn prefix_message(block: &str, message: &str) -> String {
    if block.trim().is_empty() {
        message.to_string()
    } else {
        format!("<context>\n{block}\n</context>\n\n{message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::{AffectShape, complement_for};
    use crate::types::{LifeDomain, Memory, MemoryCategory};
    use chrono::Utc;

    #[test]
    fn sections_appear_in_fixed_order() {
        let affect = complement_for(&AffectShape {
            expansion: -0.5,
            activation: -0.5,
            certainty: -0.5,
        });
        let goal = Goal::new(GoalType::Decide, "job", 0.8);
        let memories = vec![ScoredMemory::new(
            Memory::new("Works night shifts", MemoryCategory::Fact, LifeDomain::Work, 0.2, Utc::now()),
            0.9,
        )];
        let block = compose(&ContextParts {
            opspec: "OPSPEC",
            affect: Some(&affect),
            goal: Some(&goal),
            patterns: &[],
            memories: &memories,
        });
        let op = block.find("OPSPEC").expect("opspec");
        let af = block.find("Affect:").expect("affect");
        let go = block.find("Current goal").expect("goal");
        let me = block.find("[work] Works night shifts").expect("memory");
        assert!(op < af && af < go && go < me);
    }

    #[test]
    fn empty_parts_compose_to_empty() {
        assert_eq!(compose(&ContextParts::default()), "");
        assert_eq!(prefix_message("", "hello"), "hello");
    }

    #[test]
    fn unclear_goal_is_not_rendered() {
        assert_eq!(render_guidance(Some(&Goal::unclear()), &[]), "");
    }

    #[test]
    fn prefix_wraps_block() {
        let out = prefix_message("ctx", "hi");
        assert!(out.starts_with("<context>\nctx\n</context>"));
        assert!(out.ends_with("\n\nhi"));
    }
}
