//! # attune-llm: provider abstraction for attune
//!
//! attune needs three things from a language-model provider:
//!   - **first-token logprobs** (top-K) for surprise scoring,
//!   - **JSON-mode completions** for conflict analysis,
//!   - **embeddings** for similarity search and backfill.
//!
//! All of them go through the [`CompletionBackend`] trait. [`LlmClient`]
//! implements it over any OpenAI-compatible HTTP API; [`mock::ScriptedBackend`]
//! implements it in-process.
//!
//! Callers layer policy on top:
//!   - [`retry::with_retry`]: explicit per-call timeout, bounded transient
//!     retries, and a separate long cooldown for rate limits
//!   - [`ratelimit::RateLimitBudget`]: token-bucket pacing for batch jobs
//!   - [`prompt::PromptEngine`]: versioned prompt templates

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client;
pub mod error;
pub mod mock;
pub mod prompt;
pub mod ratelimit;
pub mod retry;
pub mod types;

pub use backend::CompletionBackend;
pub use client::{ClientOptions, LlmClient, LlmProvider};
pub use error::{LlmError, Result};
pub use retry::{RetryPolicy, with_retry};
pub use types::{ChatMessage, ConflictAnalysis, JsonRequest, ResolutionType, TokenLogprob};
