//! Emotional-intensity ("heat") classification of a user message.
//!
//! Four ordered, mutually exclusive tiers (hot > warm > cool > cold). The
//! first tier with at least one matching phrase sets a `[base, max]`
//! window; additional matches in that tier add a diminishing bonus. Then
//! emphasis markers (intensifiers, `!!`/`??`, all-caps shouting, ellipses)
//! add small boosts. The result is clamped to the tier max and to [0, 1].
//!
//! Pure and deterministic; no external calls.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{clamp_unit, round2};

/// Heat label, one per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatLevel {
    /// Greetings and small talk.
    Cold,
    /// Informational queries.
    Cool,
    /// Noticeable distress or frustration.
    Warm,
    /// Acute distress.
    Hot,
}

impl fmt::Display for HeatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cold => "cold",
            Self::Cool => "cool",
            Self::Warm => "warm",
            Self::Hot => "hot",
        })
    }
}

/// Output of [`HeatDetector::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatReading {
    /// Intensity in [0, 1], rounded to two decimals.
    pub score: f32,
    /// Tier that produced the score.
    pub level: HeatLevel,
}

impl HeatReading {
    const EMPTY: Self = Self {
        score: 0.0,
        level: HeatLevel::Cold,
    };
}

// ---------------------------------------------------------------------------
// Tier tables
// ---------------------------------------------------------------------------

struct TierSpec {
    level: HeatLevel,
    base: f32,
    max: f32,
    per_extra: f32,
    bonus_cap: f32,
    patterns: &'static [&'static str],
}

// Intensifier words ("really", "so", ...) must never appear here: they are
// boosters, and a booster that also switched tiers would break emphasis
// monotonicity.
static TIERS: [TierSpec; 4] = [
    TierSpec {
        level: HeatLevel::Hot,
        base: 0.70,
        max: 1.0,
        per_extra: 0.10,
        bonus_cap: 0.30,
        patterns: &[
            r"\bterrified\b",
            r"\bpanic(king|ked)?\b",
            r"\bdesperate\b",
            r"\bhopeless\b",
            r"\bdevastated\b",
            r"\bsuicid",
            r"\bemergency\b",
            r"\bcrisis\b",
            r"\bbreaking down\b",
            r"\bfalling apart\b",
            r"\bfreaking out\b",
            r"\bcan'?t (take|cope|breathe|handle) (it|this|anymore)",
            r"\bdon'?t know what to do\b",
            r"\bwit'?s end\b",
        ],
    },
    TierSpec {
        level: HeatLevel::Warm,
        base: 0.45,
        max: 0.69,
        per_extra: 0.08,
        bonus_cap: 0.40,
        patterns: &[
            r"\banxious\b",
            r"\bworried\b",
            r"\bstressed\b",
            r"\bfrustrat(ed|ing)\b",
            r"\bupset\b",
            r"\bangry\b",
            r"\bsad\b",
            r"\boverwhelm(ed|ing)\b",
            r"\bstuck\b",
            r"\bscared\b",
            r"\bhurt(s|ing)?\b",
            r"\blonely\b",
            r"\bstruggling\b",
            r"\bexhausted\b",
        ],
    },
    TierSpec {
        level: HeatLevel::Cool,
        base: 0.20,
        max: 0.44,
        per_extra: 0.10,
        bonus_cap: 0.30,
        patterns: &[
            r"\bhow (do|can|should) i\b",
            r"\bhow to\b",
            r"\bwhat is\b",
            r"\bwhat'?s the best\b",
            r"\bcan you\b",
            r"\bhelp me\b",
            r"\bexplain\b",
            r"\bshould i\b",
            r"\bplan(ning)?\b",
            r"\bbudget\b",
            r"\badvice\b",
            r"\bidea(s)?\b",
        ],
    },
    TierSpec {
        level: HeatLevel::Cold,
        base: 0.02,
        max: 0.14,
        per_extra: 0.02,
        bonus_cap: 0.30,
        patterns: &[
            r"^\s*(hi|hello|hey|yo)\b",
            r"\bgood (morning|afternoon|evening)\b",
            r"\bthanks?( you)?\b",
            r"\blol\b",
            r"\bhaha\b",
            r"^\s*(ok|okay|nice)\b",
        ],
    },
];

const DEFAULT_LEVEL: HeatLevel = HeatLevel::Cool;
const DEFAULT_SCORE: f32 = 0.20;
const DEFAULT_MAX: f32 = 0.44;

const INTENSIFIERS: &str =
    r"\b(really|so|very|extremely|totally|absolutely|seriously|incredibly)\b";
const REPEATED_PUNCT: &str = r"[!?]{2,}";
const ELLIPSIS: &str = r"\.{3,}|…";

const INTENSIFIER_BOOST: f32 = 0.05;
const PUNCT_BOOST: f32 = 0.05;
const CAPS_BOOST: f32 = 0.05;
const ELLIPSIS_BOOST: f32 = 0.03;

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

struct CompiledTier {
    spec: &'static TierSpec,
    patterns: Vec<Regex>,
}

/// Compiled heat classifier. Build once and share.
pub struct HeatDetector {
    tiers: Vec<CompiledTier>,
    intensifiers: Option<Regex>,
    repeated_punct: Option<Regex>,
    ellipsis: Option<Regex>,
}

impl fmt::Debug for HeatDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeatDetector")
            .field("tiers", &self.tiers.len())
            .finish_non_exhaustive()
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| {
            tracing::warn!(pattern, error = %e, "invalid heat pattern, it will never match");
            e
        })
        .ok()
}

impl HeatDetector {
    /// Compile the tier and booster tables.
    #[must_use]
    pub fn new() -> Self {
        let tiers = TIERS
            .iter()
            .map(|spec| CompiledTier {
                spec,
                patterns: spec.patterns.iter().filter_map(|p| compile(p)).collect(),
            })
            .collect();
        Self {
            tiers,
            intensifiers: compile(INTENSIFIERS),
            repeated_punct: compile(REPEATED_PUNCT),
            ellipsis: compile(ELLIPSIS),
        }
    }

    /// Classify a message. Total: empty or whitespace input yields `0.0 / cold`.
    #[must_use]
    pub fn detect(&self, message: &str) -> HeatReading {
        if message.trim().is_empty() {
            return HeatReading::EMPTY;
        }
        let normalized = message.replace(['\u{2019}', '\u{2018}'], "'").to_lowercase();

        let (level, tier_score, max) = self
            .tiers
            .iter()
            .find_map(|tier| {
                let hits = tier.patterns.iter().filter(|re| re.is_match(&normalized)).count();
                (hits > 0).then(|| {
                    let spec = tier.spec;
                    (spec.level, spec.base + extra_bonus(hits, spec), spec.max)
                })
            })
            .unwrap_or((DEFAULT_LEVEL, DEFAULT_SCORE, DEFAULT_MAX));

        let boost = self.emphasis_boost(message, &normalized);
        let score = round2(clamp_unit((tier_score + boost).min(max)));
        HeatReading { score, level }
    }

    /// Score only; convenience for callers that ignore the label.
    #[must_use]
    pub fn score(&self, message: &str) -> f32 {
        self.detect(message).score
    }

    fn emphasis_boost(&self, raw: &str, normalized: &str) -> f32 {
        let count = |re: &Option<Regex>, text: &str| re.as_ref().map_or(0, |r| r.find_iter(text).count());
        let shouted = raw
            .split(|c: char| !c.is_alphabetic())
            .filter(|tok| tok.chars().count() >= 3 && tok.chars().all(|c| c.is_uppercase()))
            .count();

        booster(count(&self.intensifiers, normalized), INTENSIFIER_BOOST)
            + booster(count(&self.repeated_punct, normalized), PUNCT_BOOST)
            + booster(shouted, CAPS_BOOST)
            + booster(count(&self.ellipsis, normalized), ELLIPSIS_BOOST)
    }
}

impl Default for HeatDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Bonus for matches beyond the first: the k-th extra adds `per_extra / k`.
#[allow(clippy::cast_precision_loss)]
fn extra_bonus(hits: usize, spec: &TierSpec) -> f32 {
    let bonus: f32 = (1..hits).map(|k| spec.per_extra / k as f32).sum();
    bonus.min(spec.bonus_cap)
}

/// Booster contribution: counted at most twice, the second occurrence at half weight.
fn booster(occurrences: usize, weight: f32) -> f32 {
    match occurrences {
        0 => 0.0,
        1 => weight,
        _ => weight * 1.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(msg: &str) -> HeatReading {
        HeatDetector::new().detect(msg)
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(detect(""), HeatReading::EMPTY);
        assert_eq!(detect("   \n\t"), HeatReading::EMPTY);
    }

    #[test]
    fn greeting_is_cold() {
        let r = detect("Hi there!");
        assert_eq!(r.level, HeatLevel::Cold);
        assert!(r.score < 0.1, "score {}", r.score);
    }

    #[test]
    fn acute_distress_is_hot() {
        let r = detect("I'm terrified and don't know what to do anymore");
        assert_eq!(r.level, HeatLevel::Hot);
        assert!(r.score >= 0.6, "score {}", r.score);
    }

    #[test]
    fn curly_apostrophes_match_like_straight_ones() {
        let r = detect("I don\u{2019}t know what to do");
        assert_eq!(r.level, HeatLevel::Hot);
    }

    #[test]
    fn informational_query_is_cool() {
        let r = detect("How do I create a budget spreadsheet?");
        assert_eq!(r.level, HeatLevel::Cool);
        assert!(r.score >= 0.2 && r.score <= 0.44);
    }

    #[test]
    fn unmatched_message_defaults_to_mid_cool() {
        let r = detect("The train leaves at noon");
        assert_eq!(r.level, HeatLevel::Cool);
        assert!((r.score - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn extra_matches_have_diminishing_returns() {
        let one = detect("I feel anxious").score;
        let two = detect("I feel anxious and worried").score;
        let three = detect("I feel anxious and worried and stressed").score;
        assert!(two > one);
        assert!(three > two);
        assert!(three - two < two - one);
    }

    #[test]
    fn score_never_exceeds_tier_max() {
        let r = detect("So stressed, worried, anxious, upset, angry, sad, stuck, scared!!! REALLY REALLY...");
        assert_eq!(r.level, HeatLevel::Warm);
        assert!(r.score <= 0.69);
    }

    #[test]
    fn emphasis_raises_score_within_tier() {
        let base = detect("I am worried about work").score;
        let emphasized = detect("I am really worried about work!!").score;
        assert!(emphasized > base);
    }

    #[test]
    fn boosters_count_at_most_twice() {
        let two = detect("plan plan?? really really").score;
        let many = detect("plan plan?? really really really really really").score;
        assert!((two - many).abs() < f32::EPSILON);
    }

    #[test]
    fn all_caps_shouting_boosts() {
        let quiet = detect("i am upset about this").score;
        let loud = detect("i am UPSET about THIS").score;
        assert!(loud > quiet);
    }
}
