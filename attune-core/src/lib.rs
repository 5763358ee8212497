//! # attune core library
//!
//! Relevance ranking for per-user context injection. Given a user message
//! and a set of stored memories about that user, these stages decide which
//! memories to surface, how strongly, and how to speak:
//!
//! - [`heat`]: emotional intensity of the message
//! - [`goal`]: the user's current intent
//! - [`inhibition`]: drop memories irrelevant to that intent
//! - [`patterns`]: recurring behavioral patterns among what's left
//! - [`affect`]: emotional shape and the strategy that complements it
//! - [`surprise`]: KL-divergence relevance math and its TTL cache
//! - [`opspec`]: instruction fragments routed per message
//! - [`compose`]: the final context block
//!
//! Collaborators (storage, similarity search, embeddings) are traits with
//! local reference implementations. Everything here is deterministic given
//! its inputs; LLM calls live in `attune-llm` and orchestration in
//! `attune-pipeline`.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod affect;
pub mod clock;
pub mod compose;
pub mod config;
pub mod embedding;
pub mod error;
pub mod goal;
pub mod heat;
pub mod index;
pub mod inhibition;
pub mod opspec;
pub mod patterns;
pub mod repository;
pub mod search;
pub mod storage;
pub mod surprise;
pub mod types;

pub use config::AttuneConfig;
pub use error::{AttuneError, Result};
pub use types::*;
