//! Core type definitions for the attune memory model.
//!
//! [`Memory`] is the only durable, shared record. Everything else the
//! pipeline produces (goals, affect shapes, pattern matches, cache entries,
//! conflict analyses) is derived per request and owned by the call that
//! produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Unique identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a memory ID from its hyphenated string form.
    ///
    /// Returns `None` for anything that is not a UUID (LLM output is not
    /// trusted to produce well-formed ids).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// What kind of knowledge a memory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// A plain fact about the user ("works night shifts").
    Fact,
    /// Something the user cares about.
    Value,
    /// How the user relates to the assistant as a conversation partner.
    PartnerModel,
    /// What the user finds rewarding.
    Reward,
    /// A higher-order summary derived from other memories.
    Synthesis,
    /// How the user sees themselves.
    SelfModel,
}

/// The seven life domains a memory can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeDomain {
    /// Job, career, professional projects.
    Work,
    /// Family, friends, partners.
    Relationships,
    /// Physical and mental health.
    Health,
    /// Money, budgeting, spending.
    Finance,
    /// Learning, skills, self-improvement.
    Growth,
    /// Art, writing, making things.
    Creativity,
    /// Home, routines, daily life.
    Home,
}

impl LifeDomain {
    /// All domains, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Work,
        Self::Relationships,
        Self::Health,
        Self::Finance,
        Self::Growth,
        Self::Creativity,
        Self::Home,
    ];

    /// Lower-case tag used in rendered context.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Relationships => "relationships",
            Self::Health => "health",
            Self::Finance => "finance",
            Self::Growth => "growth",
            Self::Creativity => "creativity",
            Self::Home => "home",
        }
    }
}

impl fmt::Display for LifeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ten emotions a memory can optionally be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    /// Joy.
    Joy,
    /// Sadness.
    Sadness,
    /// Anger.
    Anger,
    /// Fear.
    Fear,
    /// Anxiety.
    Anxiety,
    /// Shame.
    Shame,
    /// Pride.
    Pride,
    /// Curiosity.
    Curiosity,
    /// Frustration.
    Frustration,
    /// Calm.
    Calm,
}

/// Validation lifecycle of a memory.
///
/// ```text
/// untested ──► validated ──┐
///     │                     ├──► invalidated | outdated   (terminal)
///     └──────► invalidated  │
/// provisional ► consolidated┘
///     └──────► outdated
/// ```
///
/// Nothing ever moves back to `untested` or `provisional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    /// Imported or saved, never checked.
    Untested,
    /// Confirmed by the user or by repeated evidence.
    Validated,
    /// Shown to be wrong or superseded by a conflicting record.
    Invalidated,
    /// Freshly inferred; waiting for a consolidation pass.
    Provisional,
    /// Produced by (or survived) consolidation.
    Consolidated,
    /// Superseded by newer information.
    Outdated,
}

impl ValidationState {
    /// Whether this state is terminal (the memory is retired).
    #[must_use]
    pub fn is_retired(self) -> bool {
        matches!(self, Self::Invalidated | Self::Outdated)
    }

    /// Whether a transition `self → next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next || self.is_retired() {
            return false;
        }
        match next {
            Self::Untested | Self::Provisional => false,
            Self::Validated => self == Self::Untested,
            Self::Consolidated => self == Self::Provisional,
            Self::Invalidated | Self::Outdated => true,
        }
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Untested => "untested",
            Self::Validated => "validated",
            Self::Invalidated => "invalidated",
            Self::Provisional => "provisional",
            Self::Consolidated => "consolidated",
            Self::Outdated => "outdated",
        };
        f.write_str(s)
    }
}

/// How long a memory is expected to stay true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// True for this conversation or day only.
    Ephemeral,
    /// True for the current phase of life.
    #[default]
    Contextual,
    /// Stable trait or long-lived fact.
    Durable,
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// A dense vector embedding for semantic similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Cosine similarity between two embeddings.
    /// Returns 0.0 if the vectors differ in length or either has zero magnitude.
    #[must_use]
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let (mut dot, mut norm_a, mut norm_b) = (0.0_f32, 0.0_f32, 0.0_f32);
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom < f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }

    /// Dimensionality of the embedding.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// A durable record of something known about the user.
///
/// Never hard-deleted by the pipeline: consolidation retires records by
/// moving them to a terminal [`ValidationState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Unique identifier.
    pub id: MemoryId,
    /// Free-text content.
    pub content: String,
    /// Knowledge category.
    pub category: MemoryCategory,
    /// Life domain this memory belongs to.
    pub domain: LifeDomain,
    /// Optional emotion tag.
    #[serde(default)]
    pub emotion: Option<Emotion>,
    /// Emotional intensity, clamped to [0, 1].
    pub heat: f32,
    /// Validation lifecycle state.
    pub validation: ValidationState,
    /// Expected lifetime.
    #[serde(default)]
    pub durability: Durability,
    /// Optional embedding (filled lazily by the backfill job).
    #[serde(default)]
    pub embedding: Option<Embedding>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,
    /// When the record was last surfaced in a context block.
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    /// How many times the record has been surfaced.
    #[serde(default)]
    pub access_count: u32,
}

impl Memory {
    /// Create a new `untested` memory, clamping heat to [0, 1].
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        category: MemoryCategory,
        domain: LifeDomain,
        heat: f32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MemoryId::new(),
            content: content.into(),
            category,
            domain,
            emotion: None,
            heat: clamp_unit(heat),
            validation: ValidationState::Untested,
            durability: Durability::default(),
            embedding: None,
            created_at,
            updated_at: created_at,
            last_accessed: None,
            access_count: 0,
        }
    }

    /// Attach an emotion tag.
    #[must_use]
    pub fn with_emotion(mut self, emotion: Emotion) -> Self {
        self.emotion = Some(emotion);
        self
    }

    /// Set the initial validation state (used for imports and inferred records).
    #[must_use]
    pub fn with_validation(mut self, state: ValidationState) -> Self {
        self.validation = state;
        self
    }

    /// Set the durability class.
    #[must_use]
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Whether the memory is still eligible for retrieval.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.validation.is_retired()
    }

    /// Record that the memory was surfaced in a context block.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Some(now);
    }
}

/// A memory paired with the similarity score assigned by the search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    /// The candidate memory.
    pub memory: Memory,
    /// Incoming similarity / resonance score in [0, 1].
    pub similarity: f32,
}

impl ScoredMemory {
    /// Pair a memory with a similarity score (clamped to [0, 1]).
    #[must_use]
    pub fn new(memory: Memory, similarity: f32) -> Self {
        Self {
            memory,
            similarity: clamp_unit(similarity),
        }
    }
}

/// One turn of recent conversation, oldest first when passed as a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Who spoke.
    pub role: TurnRole,
    /// What was said.
    pub content: String,
}

impl ConversationTurn {
    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The human user.
    User,
    /// The chat assistant.
    Assistant,
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

/// Clamp to [0, 1], mapping NaN to 0.
#[must_use]
pub fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Round to two decimal places.
#[must_use]
pub fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heat_is_clamped_on_creation() {
        let m = Memory::new("x", MemoryCategory::Fact, LifeDomain::Work, 3.0, Utc::now());
        assert_eq!(m.heat, 1.0);
        let m = Memory::new("x", MemoryCategory::Fact, LifeDomain::Work, -1.0, Utc::now());
        assert_eq!(m.heat, 0.0);
        let m = Memory::new("x", MemoryCategory::Fact, LifeDomain::Work, f32::NAN, Utc::now());
        assert_eq!(m.heat, 0.0);
    }

    #[test]
    fn validation_transitions_are_one_directional() {
        use ValidationState::*;
        assert!(Untested.can_transition_to(Validated));
        assert!(Untested.can_transition_to(Invalidated));
        assert!(Provisional.can_transition_to(Consolidated));
        assert!(Provisional.can_transition_to(Outdated));
        assert!(Validated.can_transition_to(Invalidated));

        assert!(!Validated.can_transition_to(Untested));
        assert!(!Consolidated.can_transition_to(Provisional));
        assert!(!Invalidated.can_transition_to(Validated));
        assert!(!Outdated.can_transition_to(Consolidated));
        assert!(!Untested.can_transition_to(Consolidated));
        assert!(!Provisional.can_transition_to(Validated));
    }

    #[test]
    fn memory_id_parse_rejects_garbage() {
        let id = MemoryId::new();
        assert_eq!(MemoryId::parse(&id.to_string()), Some(id));
        assert_eq!(MemoryId::parse("mem-42"), None);
    }

    #[test]
    fn memory_json_tolerates_missing_optional_fields() {
        let json = format!(
            r#"{{"id":"{}","content":"likes tea","category":"fact","domain":"home",
            "heat":0.2,"validation":"untested","created_at":"2026-01-01T00:00:00Z",
            "updated_at":"2026-01-01T00:00:00Z"}}"#,
            MemoryId::new()
        );
        let m: Memory = serde_json::from_str(&json).expect("parse");
        assert_eq!(m.access_count, 0);
        assert!(m.embedding.is_none());
        assert_eq!(m.durability, Durability::Contextual);
    }
}
