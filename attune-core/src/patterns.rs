//! Behavioral pattern detection ("verbs").
//!
//! A pattern is a recurring invariant in how the user acts, independent of
//! subject matter: "spirals via option-accumulation" shows up in job
//! searches and apartment hunts alike. The catalog is static; each
//! request matches it against the memories that survived inhibition.
//!
//! # Confidence
//!
//! | Signal | Contribution |
//! |--------|--------------|
//! | instances ≥4 / ≥3 / ≥2 / else | 0.35 / 0.25 / 0.15 / 0.05 |
//! | domains ≥3 / ≥2 | +0.25 / +0.15 |
//! | instances in recency window ≥2 / ≥1 | +0.15 / +0.08 |
//! | message hits a query bridge | +0.25 |
//!
//! Score ≥0.70 is HIGH, ≥0.40 MEDIUM, else LOW.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::PatternConfig;
use crate::types::{LifeDomain, Memory, ScoredMemory, round2};

/// Confidence level of a detected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLevel {
    /// Score < 0.40.
    Low,
    /// Score in [0.40, 0.70).
    Medium,
    /// Score ≥ 0.70.
    High,
}

impl ConfidenceLevel {
    /// Level for a score.
    #[must_use]
    pub fn from_score(score: f32) -> Self {
        if score >= 0.70 {
            Self::High
        } else if score >= 0.40 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Score plus level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatternConfidence {
    /// Score in [0, 1], two decimals.
    pub score: f32,
    /// Bucketed level.
    pub level: ConfidenceLevel,
}

/// A catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct PatternDef {
    /// Stable id.
    pub id: &'static str,
    /// One-line "verb" description.
    pub verb: &'static str,
    /// How the assistant should use the pattern.
    pub application: &'static str,
    /// Regexes over lower-cased memory content.
    pub match_patterns: &'static [&'static str],
    /// Regexes over the lower-cased message that make the pattern relevant now.
    pub query_bridges: &'static [&'static str],
    /// Regexes over the lower-cased message suggesting the pattern is breaking.
    pub contradiction_bridges: &'static [&'static str],
}

/// The built-in pattern catalog.
pub const CATALOG: &[PatternDef] = &[
    PatternDef {
        id: "option-accumulation",
        verb: "spirals via option-accumulation",
        application: "Narrow the field to two options and ask which one they would regret not choosing.",
        match_patterns: &[
            r"\b(more|other|another|too many) options?\b",
            r"\balternatives?\b",
            r"\bcan'?t decide\b",
            r"\bkeep(s)? researching\b",
            r"\btorn between\b",
            r"\bcompar(e|ed|ing)\b",
        ],
        query_bridges: &[r"\bshould i\b", r"\bdecid(e|ing)\b", r"\bchoos(e|ing)\b", r"\bwhich (one|option)\b"],
        contradiction_bridges: &[r"\bi('ve| have)? decided\b", r"\bmade (up )?my mind\b", r"\bi chose\b"],
    },
    PatternDef {
        id: "overcommitment",
        verb: "says yes before checking capacity",
        application: "Before adding anything, ask what comes off the plate.",
        match_patterns: &[
            r"\bsaid yes\b",
            r"\bagreed to\b",
            r"\btook on\b",
            r"\bovercommit\w*",
            r"\bspread (too )?thin\b",
            r"\bcouldn'?t say no\b",
        ],
        query_bridges: &[r"\bschedule\b", r"\bbusy\b", r"\bno time\b", r"\bthis week\b", r"\bplan\b"],
        contradiction_bridges: &[r"\bsaid no\b", r"\bdeclined\b", r"\bturned (it|them) down\b"],
    },
    PatternDef {
        id: "avoidance-crunch",
        verb: "defers until deadline pressure forces action",
        application: "Offer a five-minute first step they can start now instead of a full plan.",
        match_patterns: &[
            r"\bprocrastinat\w*",
            r"\bput(ting)? (it )?off\b",
            r"\blast minute\b",
            r"\bavoid(ed|ing)\b",
            r"\bpulled an all-?nighter\b",
        ],
        query_bridges: &[r"\bdeadline\b", r"\bdue\b", r"\bget started\b", r"\bmotivat\w*"],
        contradiction_bridges: &[r"\bstarted early\b", r"\bahead of schedule\b"],
    },
    PatternDef {
        id: "external-validation",
        verb: "checks decisions with others before trusting own judgment",
        application: "Reflect their own reasoning back before offering an opinion.",
        match_patterns: &[
            r"\basked (my|everyone|all my|friends)\b",
            r"\bsecond opinion\b",
            r"\bneed(ed|s)? reassurance\b",
            r"\bwhat (would|will) (people|others|they) think\b",
        ],
        query_bridges: &[r"\bright call\b", r"\bis it (ok|okay)\b", r"\bam i wrong\b", r"\bwhat do you think\b"],
        contradiction_bridges: &[r"\btrust(ed)? my gut\b", r"\bdidn'?t ask anyone\b"],
    },
    PatternDef {
        id: "push-crash",
        verb: "pushes hard, then crashes",
        application: "Name the cycle gently and suggest a pace they could sustain for a month.",
        match_patterns: &[
            r"\bburn(ed|t)? ?out\b",
            r"\bcrash(ed|ing)\b",
            r"\bexhausted\b",
            r"\bpushed (through|hard)\b",
            r"\bno breaks?\b",
        ],
        query_bridges: &[r"\btired\b", r"\benergy\b", r"\brest\b", r"\bburn ?out\b", r"\bsleep\b"],
        contradiction_bridges: &[r"\btook a break\b", r"\bpaced myself\b", r"\brested\b"],
    },
];

/// A detected pattern, instantiated for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    /// Catalog id.
    pub id: &'static str,
    /// Verb description.
    pub verb: &'static str,
    /// Recommended application.
    pub application: &'static str,
    /// Distinct domains touched by supporting memories.
    pub domains: BTreeSet<LifeDomain>,
    /// Number of supporting memories.
    pub instance_count: usize,
    /// Confidence.
    pub confidence: PatternConfidence,
    /// Up to `max_samples` supporting memory contents.
    pub samples: Vec<String>,
    /// The message hits one of the pattern's query bridges.
    pub query_relevant: bool,
    /// The message suggests the user is currently breaking the pattern.
    pub contradicted: bool,
}

struct CompiledPattern {
    def: &'static PatternDef,
    matchers: Vec<Regex>,
    query: Vec<Regex>,
    contradiction: Vec<Regex>,
}

fn compile_all(patterns: &[&str], id: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            Regex::new(p)
                .map_err(|e| tracing::warn!(pattern = id, regex = p, error = %e, "invalid pattern regex"))
                .ok()
        })
        .collect()
}

/// Matches the pattern catalog against memories.
pub struct PatternScout {
    patterns: Vec<CompiledPattern>,
    config: PatternConfig,
}

impl std::fmt::Debug for PatternScout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternScout")
            .field("patterns", &self.patterns.len())
            .field("config", &self.config)
            .finish()
    }
}

impl PatternScout {
    /// Compile the built-in catalog.
    #[must_use]
    pub fn new(config: PatternConfig) -> Self {
        Self::with_catalog(CATALOG, config)
    }

    /// Compile a custom catalog.
    #[must_use]
    pub fn with_catalog(catalog: &'static [PatternDef], config: PatternConfig) -> Self {
        let patterns = catalog
            .iter()
            .map(|def| CompiledPattern {
                def,
                matchers: compile_all(def.match_patterns, def.id),
                query: compile_all(def.query_bridges, def.id),
                contradiction: compile_all(def.contradiction_bridges, def.id),
            })
            .collect();
        Self { patterns, config }
    }

    /// Detect patterns among `memories`, ranked for `message` at time `now`.
    #[must_use]
    pub fn scout(&self, memories: &[ScoredMemory], message: &str, now: DateTime<Utc>) -> Vec<PatternMatch> {
        let lowered_message = message.replace('\u{2019}', "'").to_lowercase();
        let contents: Vec<String> = memories
            .iter()
            .map(|m| m.memory.content.replace('\u{2019}', "'").to_lowercase())
            .collect();

        let mut detected: Vec<PatternMatch> = self
            .patterns
            .iter()
            .filter_map(|p| {
                let instances: Vec<&Memory> = memories
                    .iter()
                    .zip(&contents)
                    .filter(|(_, text)| p.matchers.iter().any(|re| re.is_match(text)))
                    .map(|(m, _)| &m.memory)
                    .collect();
                (!instances.is_empty()).then(|| self.build_match(p, &instances, &lowered_message, now))
            })
            .collect();

        if detected.iter().any(|m| m.query_relevant) {
            detected.retain(|m| m.query_relevant);
        }
        detected.sort_by(|a, b| b.confidence.score.total_cmp(&a.confidence.score));
        detected.truncate(self.config.max_patterns);
        detected.retain(|m| !(m.confidence.level == ConfidenceLevel::Low && m.instance_count == 1));

        tracing::debug!(patterns = detected.len(), "pattern scout");
        detected
    }

    fn build_match(
        &self,
        pattern: &CompiledPattern,
        instances: &[&Memory],
        message: &str,
        now: DateTime<Utc>,
    ) -> PatternMatch {
        let domains: BTreeSet<LifeDomain> = instances.iter().map(|m| m.domain).collect();
        let window = Duration::days(i64::from(self.config.recency_window_days));
        let recent = instances
            .iter()
            .filter(|m| now.signed_duration_since(m.created_at) <= window)
            .count();
        let query_relevant = pattern.query.iter().any(|re| re.is_match(message));
        let contradicted = pattern.contradiction.iter().any(|re| re.is_match(message));

        let score = confidence_score(instances.len(), domains.len(), recent, query_relevant);

        PatternMatch {
            id: pattern.def.id,
            verb: pattern.def.verb,
            application: pattern.def.application,
            domains,
            instance_count: instances.len(),
            confidence: PatternConfidence {
                score,
                level: ConfidenceLevel::from_score(score),
            },
            samples: instances
                .iter()
                .take(self.config.max_samples)
                .map(|m| m.content.clone())
                .collect(),
            query_relevant,
            contradicted,
        }
    }
}

/// Confidence score from the four signals; see the module docs.
#[must_use]
pub fn confidence_score(instances: usize, domains: usize, recent: usize, query_relevant: bool) -> f32 {
    let base: f32 = match instances {
        n if n >= 4 => 0.35,
        3 => 0.25,
        2 => 0.15,
        _ => 0.05,
    };
    let cross_domain = match domains {
        n if n >= 3 => 0.25,
        2 => 0.15,
        _ => 0.0,
    };
    let recency = match recent {
        n if n >= 2 => 0.15,
        1 => 0.08,
        _ => 0.0,
    };
    let relevance = if query_relevant { 0.25 } else { 0.0 };
    round2((base + cross_domain + recency + relevance).clamp(0.0, 1.0))
}
