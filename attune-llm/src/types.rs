//! Request and response types shared by every backend.

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};

/// Chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions.
    System,
    /// The end user.
    User,
    /// The model.
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One candidate for the first generated token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    /// Token text.
    pub token: String,
    /// Natural-log probability.
    pub logprob: f64,
}

impl TokenLogprob {
    /// Convenience constructor.
    #[must_use]
    pub fn new(token: impl Into<String>, logprob: f64) -> Self {
        Self {
            token: token.into(),
            logprob,
        }
    }
}

/// A structured-output (JSON mode) completion request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRequest {
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub user: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl JsonRequest {
    /// Request with conservative defaults for analysis work.
    #[must_use]
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 500,
            temperature: 0.1,
        }
    }

    /// Set the token budget.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Parse a raw JSON completion as `T`.
///
/// # Errors
/// Returns `LlmError::Parse` if the text is not valid JSON of that shape.
pub fn parse_structured<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw.trim()).map_err(|e| LlmError::Parse(format!("{e}; raw text: '{raw}'")))
}

/// How a detected contradiction should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionType {
    /// The new fact supersedes the old one.
    Update,
    /// Both facts combine into one.
    Merge,
    /// The facts apply to different contexts.
    Split,
    /// Nothing to resolve.
    #[default]
    None,
}

/// Structured verdict of a conflict analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    /// Whether the candidate contradicts any existing memory.
    pub has_conflict: bool,
    /// Ids (as sent in the prompt) of the contradicted memories.
    #[serde(default)]
    pub conflicting_ids: Vec<String>,
    /// Resolution strategy.
    #[serde(default)]
    pub resolution_type: ResolutionType,
    /// Text of the single authoritative record.
    #[serde(default)]
    pub consolidated_content: String,
    /// Free-text rationale.
    #[serde(default)]
    pub explanation: String,
}

impl ConflictAnalysis {
    /// A "nothing to do" verdict.
    #[must_use]
    pub fn no_conflict(explanation: impl Into<String>) -> Self {
        Self {
            has_conflict: false,
            conflicting_ids: Vec::new(),
            resolution_type: ResolutionType::None,
            consolidated_content: String::new(),
            explanation: explanation.into(),
        }
    }

    /// Check internal consistency of a parsed verdict.
    ///
    /// # Errors
    /// Returns `LlmError::SchemaValidation` when a conflict is reported
    /// without ids, without a resolution type, or without content.
    pub fn validate(&self) -> Result<()> {
        if !self.has_conflict {
            return Ok(());
        }
        if self.conflicting_ids.is_empty() {
            return Err(LlmError::SchemaValidation(
                "has_conflict is true but conflicting_ids is empty".into(),
            ));
        }
        if self.resolution_type == ResolutionType::None {
            return Err(LlmError::SchemaValidation(
                "has_conflict is true but resolution_type is none".into(),
            ));
        }
        if self.consolidated_content.trim().is_empty() {
            return Err(LlmError::SchemaValidation(
                "has_conflict is true but consolidated_content is empty".into(),
            ));
        }
        Ok(())
    }
}
