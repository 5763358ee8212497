//! Prompt templates for attune's LLM operations.
//!
//! Every prompt is a versioned, testable artifact. Built-in templates are
//! compiled in; a deployment can override them from a directory of TOML
//! files (`conflict_analysis.toml`, ...).

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{LlmError, Result};

/// Conflict analysis (structured output).
pub const CONFLICT_ANALYSIS_SYSTEM: &str = r"You maintain a memory store about one user.
Decide whether a NEW memory contradicts any EXISTING memory.
A contradiction means both cannot be true of the user at the same time.
Different topics, added detail, or compatible preferences are NOT contradictions.
Only list ids that appear in the EXISTING list.
Your response must be valid JSON.";

/// Conflict analysis user turn.
pub const CONFLICT_ANALYSIS_USER: &str = r#"NEW memory:
{candidate}

EXISTING memories (id: content):
{existing_memories}

Return JSON:
{{"has_conflict": <bool>, "conflicting_ids": ["id", ...], "resolution_type": "update|merge|split|none", "consolidated_content": "single authoritative statement, or empty", "explanation": "one sentence"}}"#;

/// Surprise probe without the memory.
pub const SURPRISE_BASELINE_SYSTEM: &str = r"You are a helpful assistant. Reply to the user's message.";

/// Surprise probe with the memory in context.
pub const SURPRISE_CONDITIONED_SYSTEM: &str = r"You are a helpful assistant. Reply to the user's message.
Something you know about this user: {memory}";

/// User turn shared by both surprise probes.
pub const SURPRISE_USER: &str = "{message}";

/// Simple template interpolation for prompts.
///
/// Replaces `{key}` with the corresponding value. `{{` and `}}` are
/// literal braces.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result.replace("{{", "{").replace("}}", "}")
}

// ---------------------------------------------------------------------------
// PromptEngine: Versioned TOML Template Loader
// ---------------------------------------------------------------------------

/// Identifies a prompt template by purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptId {
    /// Contradiction check between a candidate and stored memories.
    ConflictAnalysis,
    /// Surprise probe without the memory.
    SurpriseBaseline,
    /// Surprise probe with the memory.
    SurpriseConditioned,
}

impl PromptId {
    /// Returns the TOML filename (without path) for this prompt.
    #[must_use]
    pub fn filename(self) -> &'static str {
        match self {
            Self::ConflictAnalysis => "conflict_analysis.toml",
            Self::SurpriseBaseline => "surprise_baseline.toml",
            Self::SurpriseConditioned => "surprise_conditioned.toml",
        }
    }

    /// All prompt IDs.
    #[must_use]
    pub fn all() -> &'static [PromptId] {
        &[Self::ConflictAnalysis, Self::SurpriseBaseline, Self::SurpriseConditioned]
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConflictAnalysis => "conflict_analysis",
            Self::SurpriseBaseline => "surprise_baseline",
            Self::SurpriseConditioned => "surprise_conditioned",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PromptId {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conflict_analysis" => Ok(Self::ConflictAnalysis),
            "surprise_baseline" => Ok(Self::SurpriseBaseline),
            "surprise_conditioned" => Ok(Self::SurpriseConditioned),
            _ => Err(LlmError::Config(format!("unknown prompt id: '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TomlPromptFile {
    prompt: TomlPromptData,
}

#[derive(Debug, Clone, Deserialize)]
struct TomlPromptData {
    version: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default)]
    temperature: f32,
    system: String,
    user: String,
}

fn default_max_tokens() -> u32 {
    1
}

/// A loaded, ready-to-render prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    /// Prompt version string (e.g., "1.0").
    pub version: String,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// System prompt template (contains `{key}` placeholders).
    pub system: String,
    /// User prompt template (contains `{key}` placeholders).
    pub user: String,
}

/// Engine that holds versioned prompt templates and renders them.
///
/// # Example
///
/// ```
/// use attune_llm::prompt::{PromptEngine, PromptId};
///
/// let engine = PromptEngine::builtin();
/// let (system, user) = engine
///     .render(PromptId::SurpriseConditioned, &[("memory", "Has two cats"), ("message", "Any pet tips?")])
///     .unwrap();
/// assert!(system.contains("Has two cats"));
/// assert_eq!(user, "Any pet tips?");
/// ```
#[derive(Debug, Clone)]
pub struct PromptEngine {
    templates: HashMap<PromptId, PromptTemplate>,
}

impl PromptEngine {
    /// Create a `PromptEngine` pre-loaded with the built-in templates.
    #[must_use]
    pub fn builtin() -> Self {
        let builtin = |max_tokens, temperature, system: &str, user: &str| PromptTemplate {
            version: "builtin".into(),
            max_tokens,
            temperature,
            system: system.into(),
            user: user.into(),
        };
        let mut templates = HashMap::new();
        templates.insert(
            PromptId::ConflictAnalysis,
            builtin(500, 0.1, CONFLICT_ANALYSIS_SYSTEM, CONFLICT_ANALYSIS_USER),
        );
        templates.insert(
            PromptId::SurpriseBaseline,
            builtin(1, 0.0, SURPRISE_BASELINE_SYSTEM, SURPRISE_USER),
        );
        templates.insert(
            PromptId::SurpriseConditioned,
            builtin(1, 0.0, SURPRISE_CONDITIONED_SYSTEM, SURPRISE_USER),
        );
        Self { templates }
    }

    /// Built-ins, overridden by any matching TOML files in `dir`.
    ///
    /// Unknown files are ignored.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Config` if the directory is missing or a TOML
    /// file exists but cannot be parsed.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LlmError::Config(format!(
                "prompt directory not found: {}",
                dir.display()
            )));
        }
        let mut engine = Self::builtin();
        for id in PromptId::all() {
            let path = dir.join(id.filename());
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| LlmError::Config(format!("failed to read {}: {e}", path.display())))?;
            let parsed: TomlPromptFile = toml::from_str(&content)
                .map_err(|e| LlmError::Config(format!("failed to parse {}: {e}", path.display())))?;
            let d = parsed.prompt;
            tracing::debug!(prompt = %id, version = %d.version, "prompt override loaded");
            engine.templates.insert(
                *id,
                PromptTemplate {
                    version: d.version,
                    max_tokens: d.max_tokens,
                    temperature: d.temperature,
                    system: d.system,
                    user: d.user,
                },
            );
        }
        Ok(engine)
    }

    /// Get a loaded prompt template by ID.
    #[must_use]
    pub fn get(&self, id: PromptId) -> Option<&PromptTemplate> {
        self.templates.get(&id)
    }

    /// Render both system and user prompts for a given ID.
    ///
    /// Returns `(system_prompt, user_prompt)` with all `{key}` placeholders
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt ID is not loaded.
    pub fn render(&self, id: PromptId, vars: &[(&str, &str)]) -> Result<(String, String)> {
        let tpl = self
            .get(id)
            .ok_or_else(|| LlmError::Config(format!("prompt template '{id}' not loaded")))?;
        Ok((render_template(&tpl.system, vars), render_template(&tpl.user, vars)))
    }

    /// Number of loaded templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether no templates are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::builtin()
    }
}
