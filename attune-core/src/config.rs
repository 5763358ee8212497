//! Configuration for the attune pipeline.
//!
//! Maps directly to `attune.toml`. Every section is optional; missing
//! keys fall back to the defaults below.

use serde::{Deserialize, Serialize};

/// Top-level attune configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttuneConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Goal-based memory inhibition.
    #[serde(default)]
    pub inhibition: InhibitionConfig,
    /// Behavioral pattern detection.
    #[serde(default)]
    pub patterns: PatternConfig,
    /// Surprise scoring and its cache.
    #[serde(default)]
    pub surprise: SurpriseConfig,
    /// Out-of-band consolidation scans.
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Embedding backfill job.
    #[serde(default)]
    pub backfill: BackfillConfig,
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Key-value persistence.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AttuneConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `AttuneError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        toml::from_str(toml_str).map_err(|e| crate::AttuneError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether context injection is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
    /// Number of recent turns handed to the goal extractor.
    #[serde(default = "default_6_usize")]
    pub recent_turns: usize,
    /// Candidates requested from the similarity search per message.
    #[serde(default = "default_12_usize")]
    pub candidate_limit: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
            json_logs: false,
            recent_turns: 6,
            candidate_limit: 12,
        }
    }
}

/// Goal-based inhibition settings.
///
/// The threshold and cap have no derivation beyond "works in practice";
/// they are tunables, not law.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InhibitionConfig {
    /// Maximum memories passed downstream.
    #[serde(default = "default_3_usize")]
    pub max_memories: usize,
    /// Below this goal confidence the inhibitor fails open.
    #[serde(default = "default_0_3")]
    pub min_goal_confidence: f32,
    /// Candidates scoring below this goal relevance are inhibited.
    #[serde(default = "default_0_3")]
    pub min_relevance: f32,
    /// Memories hotter than this are never inhibited.
    #[serde(default = "default_0_7")]
    pub high_heat_floor: f32,
    /// Attach a per-memory inhibition report to the outcome.
    #[serde(default)]
    pub emit_report: bool,
}

impl Default for InhibitionConfig {
    fn default() -> Self {
        Self {
            max_memories: 3,
            min_goal_confidence: 0.3,
            min_relevance: 0.3,
            high_heat_floor: 0.7,
            emit_report: false,
        }
    }
}

/// Behavioral pattern detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Maximum patterns surfaced per message.
    #[serde(default = "default_3_usize")]
    pub max_patterns: usize,
    /// Window for the recency bonus, in days.
    #[serde(default = "default_30")]
    pub recency_window_days: u32,
    /// Maximum supporting instances quoted per pattern.
    #[serde(default = "default_3_usize")]
    pub max_samples: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            max_patterns: 3,
            recency_window_days: 30,
            max_samples: 3,
        }
    }
}

/// Surprise scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurpriseConfig {
    /// Whether surprise re-ranking runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cache entry lifetime in seconds.
    #[serde(default = "default_300_u64")]
    pub cache_ttl_secs: u64,
    /// Hard capacity bound of the cache (least-recently-used eviction).
    #[serde(default = "default_1000_usize")]
    pub cache_capacity: usize,
    /// Size above which an insert triggers an expired-entry sweep.
    #[serde(default = "default_200_usize")]
    pub cleanup_threshold: usize,
    /// Number of top log-probabilities requested per probe.
    #[serde(default = "default_20_u8")]
    pub top_logprobs: u8,
    /// Weight of the normalised surprise term when re-ranking.
    #[serde(default = "default_0_5")]
    pub rerank_weight: f32,
    /// Wall-clock budget of the whole surprise stage for one request, in
    /// milliseconds. Past it, memories keep their similarity order.
    #[serde(default = "default_2500")]
    pub budget_ms: u64,
}

impl Default for SurpriseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: 300,
            cache_capacity: 1000,
            cleanup_threshold: 200,
            top_logprobs: 20,
            rerank_weight: 0.5,
            budget_ms: 2_500,
        }
    }
}

/// Consolidation scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Default number of provisional memories fetched per scan.
    #[serde(default = "default_50_usize")]
    pub scan_limit: usize,
    /// Similar memories retrieved per candidate.
    #[serde(default = "default_8_usize")]
    pub search_limit: usize,
    /// Minimum similarity for a stored memory to be compared.
    #[serde(default = "default_0_5")]
    pub min_similarity: f32,
    /// Candidates processed concurrently (1 = sequential).
    #[serde(default = "default_1_usize")]
    pub max_concurrency: usize,
    /// Provider request budget for the scan.
    #[serde(default = "default_30_u32")]
    pub requests_per_minute: u32,
    /// Burst allowance on top of the steady budget.
    #[serde(default = "default_3_u32")]
    pub burst: u32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            scan_limit: 50,
            search_limit: 8,
            min_similarity: 0.5,
            max_concurrency: 1,
            requests_per_minute: 30,
            burst: 3,
        }
    }
}

/// Embedding backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Memories embedded per provider call.
    #[serde(default = "default_16_usize")]
    pub batch_size: usize,
    /// Provider request budget.
    #[serde(default = "default_30_u32")]
    pub requests_per_minute: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            requests_per_minute: 30,
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    /// API key. Prefer `api_key_env` so keys stay out of config files.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used for logprob probes.
    #[serde(default = "default_probe_model")]
    pub probe_model: String,
    /// Model used for structured conflict analysis.
    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,
    /// Model used for embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Hard timeout for any completion call in milliseconds.
    #[serde(default = "default_15000")]
    pub request_timeout_ms: u64,
    /// Timeout for credential checks in milliseconds.
    #[serde(default = "default_10000")]
    pub auth_timeout_ms: u64,
    /// Attempts per call for transient failures.
    #[serde(default = "default_3_u32")]
    pub max_attempts: u32,
    /// Fixed delay between transient retries in milliseconds.
    #[serde(default = "default_500")]
    pub retry_delay_ms: u64,
    /// Cooldown after an explicit rate-limit signal, in seconds.
    #[serde(default = "default_60")]
    pub rate_limit_cooldown_secs: u64,
    /// Rate-limit cooldowns allowed per call before giving up.
    #[serde(default = "default_1_u32")]
    pub max_rate_limit_waits: u32,
}

impl LlmConfig {
    /// Resolve the API key from config or environment.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            probe_model: "gpt-4o-mini".to_string(),
            analysis_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_ms: 15_000,
            auth_timeout_ms: 10_000,
            max_attempts: 3,
            retry_delay_ms: 500,
            rate_limit_cooldown_secs: 60,
            max_rate_limit_waits: 1,
        }
    }
}

/// Key-value persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend: "memory" or "sqlite".
    #[serde(default = "default_sqlite")]
    pub backend: String,
    /// Database path for the sqlite backend.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: "attune.db".to_string(),
            wal_mode: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_openai_url() -> String { "https://api.openai.com".to_string() }
fn default_api_key_env() -> String { "OPENAI_API_KEY".to_string() }
fn default_probe_model() -> String { "gpt-4o-mini".to_string() }
fn default_analysis_model() -> String { "gpt-4o-mini".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_sqlite() -> String { "sqlite".to_string() }
fn default_db_path() -> String { "attune.db".to_string() }
fn default_0_3() -> f32 { 0.3 }
fn default_0_5() -> f32 { 0.5 }
fn default_0_7() -> f32 { 0.7 }
fn default_1_u32() -> u32 { 1 }
fn default_3_u32() -> u32 { 3 }
fn default_30_u32() -> u32 { 30 }
fn default_30() -> u32 { 30 }
fn default_20_u8() -> u8 { 20 }
fn default_1_usize() -> usize { 1 }
fn default_3_usize() -> usize { 3 }
fn default_6_usize() -> usize { 6 }
fn default_8_usize() -> usize { 8 }
fn default_12_usize() -> usize { 12 }
fn default_16_usize() -> usize { 16 }
fn default_50_usize() -> usize { 50 }
fn default_200_usize() -> usize { 200 }
fn default_1000_usize() -> usize { 1000 }
fn default_60() -> u64 { 60 }
fn default_300_u64() -> u64 { 300 }
fn default_500() -> u64 { 500 }
fn default_2500() -> u64 { 2_500 }
fn default_10000() -> u64 { 10_000 }
fn default_15000() -> u64 { 15_000 }
