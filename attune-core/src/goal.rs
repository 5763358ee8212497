//! Goal extraction: what is the user trying to do right now?
//!
//! [`GoalExtractor`] is the seam the pipeline depends on. The caller
//! supplies either a real implementation or [`DisabledGoalExtractor`],
//! which always answers `Unclear` and so sends the inhibitor down its
//! fail-open path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::{ConversationTurn, LifeDomain, TurnRole, clamp_unit};

/// Enumerated intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    /// Choosing between options.
    Decide,
    /// Organising future steps.
    Plan,
    /// Understanding something.
    Learn,
    /// Letting off steam; wants to be heard.
    Vent,
    /// Looking back, making sense.
    Reflect,
    /// Making something.
    Create,
    /// Reaching out to or dealing with other people.
    Connect,
    /// No intent could be inferred.
    Unclear,
}

impl GoalType {
    /// Human label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Decide => "Make a decision",
            Self::Plan => "Make a plan",
            Self::Learn => "Learn or understand",
            Self::Vent => "Be heard",
            Self::Reflect => "Reflect",
            Self::Create => "Create something",
            Self::Connect => "Connect with someone",
            Self::Unclear => "Unclear",
        }
    }
}

impl fmt::Display for GoalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decide => "decide",
            Self::Plan => "plan",
            Self::Learn => "learn",
            Self::Vent => "vent",
            Self::Reflect => "reflect",
            Self::Create => "create",
            Self::Connect => "connect",
            Self::Unclear => "unclear",
        };
        f.write_str(s)
    }
}

/// The user's inferred current intent. Recomputed per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Intent tag.
    pub goal_type: GoalType,
    /// Identifier, stable for a given type.
    pub id: String,
    /// Human label.
    pub label: String,
    /// One-line description.
    pub description: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Life domains the message touches.
    #[serde(default)]
    pub domains: BTreeSet<LifeDomain>,
    /// Bridge keywords used to match memories against the goal.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Goal {
    /// A goal of the given type with clamped confidence and no bridges.
    #[must_use]
    pub fn new(goal_type: GoalType, description: impl Into<String>, confidence: f32) -> Self {
        Self {
            goal_type,
            id: format!("goal:{goal_type}"),
            label: goal_type.label().to_string(),
            description: description.into(),
            confidence: clamp_unit(confidence),
            domains: BTreeSet::new(),
            keywords: Vec::new(),
        }
    }

    /// The "no idea" goal.
    #[must_use]
    pub fn unclear() -> Self {
        Self::new(GoalType::Unclear, "No clear intent", 0.0)
    }

    /// Attach domains.
    #[must_use]
    pub fn with_domains(mut self, domains: impl IntoIterator<Item = LifeDomain>) -> Self {
        self.domains.extend(domains);
        self
    }

    /// Attach bridge keywords (lower-cased).
    #[must_use]
    pub fn with_keywords<S: AsRef<str>>(mut self, keywords: impl IntoIterator<Item = S>) -> Self {
        self.keywords
            .extend(keywords.into_iter().map(|k| k.as_ref().to_lowercase()));
        self
    }
}

/// Infers a [`Goal`] from the current message and recent turns (oldest first).
#[async_trait]
pub trait GoalExtractor: Send + Sync {
    /// Extract the current goal. Must not fail: unknown means `Unclear`.
    async fn extract(&self, message: &str, recent_turns: &[ConversationTurn]) -> Goal;
}

/// Explicit stand-in when goal extraction is turned off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGoalExtractor;

#[async_trait]
impl GoalExtractor for DisabledGoalExtractor {
    async fn extract(&self, _message: &str, _recent_turns: &[ConversationTurn]) -> Goal {
        Goal::unclear()
    }
}

// ---------------------------------------------------------------------------
// Keyword heuristics
// ---------------------------------------------------------------------------

const INTENT_CUES: &[(GoalType, &[&str])] = &[
    (
        GoalType::Decide,
        &["should i", "decide", "choose", "torn between", "which one", "pros and cons", "or not", "whether"],
    ),
    (
        GoalType::Plan,
        &["plan", "schedule", "organize", "organise", "next steps", "roadmap", "prepare", "budget"],
    ),
    (
        GoalType::Learn,
        &["how do i", "how to", "what is", "explain", "understand", "learn", "teach me", "why does"],
    ),
    (
        GoalType::Vent,
        &["i hate", "so tired of", "can't stand", "fed up", "sick of", "ugh", "annoyed", "frustrated"],
    ),
    (
        GoalType::Reflect,
        &["looking back", "i realized", "i realised", "been thinking", "why do i", "pattern", "lesson"],
    ),
    (
        GoalType::Create,
        &["write", "draft", "design", "build", "create", "compose", "make a"],
    ),
    (
        GoalType::Connect,
        &["talk to", "tell my", "reach out", "apologize", "apologise", "text my", "conversation with"],
    ),
];

const DOMAIN_CUES: &[(LifeDomain, &[&str])] = &[
    (
        LifeDomain::Work,
        &["job", "work", "boss", "career", "manager", "promotion", "offer", "coworker", "project", "office"],
    ),
    (
        LifeDomain::Relationships,
        &["partner", "wife", "husband", "girlfriend", "boyfriend", "friend", "mom", "dad", "family", "sister", "brother"],
    ),
    (
        LifeDomain::Health,
        &["sleep", "doctor", "health", "anxiety", "therapy", "exercise", "gym", "diet", "sick", "tired"],
    ),
    (
        LifeDomain::Finance,
        &["money", "budget", "salary", "debt", "rent", "savings", "invest", "spend", "loan", "pay"],
    ),
    (
        LifeDomain::Growth,
        &["learn", "course", "skill", "habit", "goal", "read", "study", "improve"],
    ),
    (
        LifeDomain::Creativity,
        &["write", "novel", "paint", "music", "song", "design", "art", "draw", "story"],
    ),
    (
        LifeDomain::Home,
        &["house", "apartment", "move", "moving", "clean", "kitchen", "chores", "garden", "home"],
    ),
];

const STOPWORDS: &[&str] = &[
    "the", "and", "but", "for", "with", "that", "this", "what", "have", "about", "should", "would",
    "could", "just", "really", "from", "into", "your", "they", "them", "then", "there", "when",
    "will", "been", "some", "want", "need", "know", "like", "feel", "think", "it's", "i'm",
];

/// Weight of recent turns relative to the current message.
const HISTORY_WEIGHT: f32 = 0.4;
/// Below this summed cue weight the result is `Unclear`.
const INTENT_FLOOR: f32 = 0.5;

/// Deterministic keyword classifier over the message plus recent user turns.
///
/// Each intent cue found in the message adds 1.0; cues in earlier user
/// turns add [`HISTORY_WEIGHT`], decaying further per turn back. The
/// winning intent's confidence is its share of the total, scaled by how
/// much evidence there was.
#[derive(Debug, Clone)]
pub struct KeywordGoalExtractor {
    max_turns: usize,
}

impl KeywordGoalExtractor {
    /// Use at most `max_turns` recent turns.
    #[must_use]
    pub fn new(max_turns: usize) -> Self {
        Self { max_turns }
    }

    /// Synchronous core of [`GoalExtractor::extract`].
    #[must_use]
    pub fn classify(&self, message: &str, recent_turns: &[ConversationTurn]) -> Goal {
        let current = message.replace('\u{2019}', "'").to_lowercase();
        if current.trim().is_empty() {
            return Goal::unclear();
        }

        let mut weighted: Vec<(String, f32)> = vec![(current.clone(), 1.0)];
        let history = recent_turns
            .iter()
            .rev()
            .filter(|t| t.role == TurnRole::User)
            .take(self.max_turns);
        let mut w = HISTORY_WEIGHT;
        for turn in history {
            weighted.push((turn.content.to_lowercase(), w));
            w *= 0.5;
        }

        let mut scores = [0.0_f32; INTENT_CUES.len()];
        for (text, weight) in &weighted {
            for (slot, (_, cues)) in scores.iter_mut().zip(INTENT_CUES) {
                let hits = cues.iter().filter(|c| text.contains(*c)).count();
                #[allow(clippy::cast_precision_loss)]
                {
                    *slot += hits as f32 * weight;
                }
            }
        }

        let total: f32 = scores.iter().sum();
        let best = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(&a.0)));
        let Some((idx, &best_score)) = best else {
            return Goal::unclear();
        };
        if best_score < INTENT_FLOOR {
            return Goal::unclear().with_domains(domains_in(&current));
        }

        let goal_type = INTENT_CUES[idx].0;
        let share = best_score / total;
        let evidence = (best_score / 2.0).min(1.0);
        let confidence = share * (0.5 + 0.5 * evidence);

        let domains = domains_in(&current);
        let keywords = keywords_in(&current);
        tracing::debug!(%goal_type, confidence, domains = domains.len(), "goal classified");

        Goal::new(goal_type, summarize(message), confidence)
            .with_domains(domains)
            .with_keywords(keywords)
    }
}

impl Default for KeywordGoalExtractor {
    fn default() -> Self {
        Self::new(6)
    }
}

#[async_trait]
impl GoalExtractor for KeywordGoalExtractor {
    async fn extract(&self, message: &str, recent_turns: &[ConversationTurn]) -> Goal {
        self.classify(message, recent_turns)
    }
}

/// Domains whose cue words appear in `text`.
#[must_use]
pub fn domains_in(text: &str) -> BTreeSet<LifeDomain> {
    let words: Vec<&str> = tokenize(text).collect();
    DOMAIN_CUES
        .iter()
        .filter(|(_, cues)| cues.iter().any(|c| words.contains(c)))
        .map(|(d, _)| *d)
        .collect()
}

/// Content words of length ≥ 4, minus stopwords, deduplicated in order.
fn keywords_in(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for w in tokenize(text) {
        if w.chars().count() >= 4 && !STOPWORDS.contains(&w) && !out.iter().any(|o| o == w) {
            out.push(w.to_string());
        }
    }
    out
}

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
}

fn summarize(message: &str) -> String {
    let trimmed = message.trim();
    match trimmed.char_indices().nth(120) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(msg: &str) -> Goal {
        KeywordGoalExtractor::default().classify(msg, &[])
    }

    #[test]
    fn decision_question_is_decide() {
        let g = classify("Should I take the job offer or stay with my current boss?");
        assert_eq!(g.goal_type, GoalType::Decide);
        assert!(g.confidence >= 0.3);
        assert!(g.domains.contains(&LifeDomain::Work));
        assert!(g.keywords.contains(&"offer".to_string()));
        assert!(!g.keywords.contains(&"should".to_string()));
    }

    #[test]
    fn no_cues_is_unclear() {
        let g = classify("blue");
        assert_eq!(g.goal_type, GoalType::Unclear);
        assert_eq!(g.confidence, 0.0);
    }

    #[test]
    fn empty_is_unclear() {
        assert_eq!(classify("  ").goal_type, GoalType::Unclear);
    }

    #[test]
    fn recent_turns_tip_the_balance() {
        let ex = KeywordGoalExtractor::default();
        let turns = vec![
            ConversationTurn::user("I need to plan my week"),
            ConversationTurn::assistant("Sure, what's first?"),
        ];
        let g = ex.classify("and the gym, should I fit it in?", &turns);
        // message alone says decide; history says plan at reduced weight
        assert_eq!(g.goal_type, GoalType::Decide);
        assert!(g.confidence < classify("and the gym, should I fit it in?").confidence);
    }

    #[test]
    fn assistant_turns_are_ignored() {
        let ex = KeywordGoalExtractor::default();
        let turns = vec![ConversationTurn::assistant("Let's plan, schedule, organize a roadmap")];
        let with = ex.classify("explain compound interest", &turns);
        let without = ex.classify("explain compound interest", &[]);
        assert_eq!(with, without);
    }

    #[tokio::test]
    async fn disabled_extractor_is_unclear() {
        let g = DisabledGoalExtractor.extract("Should I quit?", &[]).await;
        assert_eq!(g.goal_type, GoalType::Unclear);
        assert_eq!(g.confidence, 0.0);
    }
}
