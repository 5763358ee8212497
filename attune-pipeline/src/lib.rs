//! # attune-pipeline: the request path and background jobs
//!
//! Wires the pure stages in `attune-core` to a provider from `attune-llm`:
//!   - [`pipeline::ContextPipeline`]: per-message context block, always
//!     degrading instead of failing
//!   - [`surprise::SurpriseScorer`]: KL-divergence re-ranking with a shared,
//!     invalidatable cache
//!   - [`consolidator::MemoryConsolidator`]: conflict detection and atomic
//!     resolution over provisional memories
//!   - [`backfill::backfill_embeddings`]: fills missing vectors in paced batches
//!   - [`runtime::AttuneRuntime`]: builds all of the above from one config
//!   - [`invalidation::spawn_invalidation_listener`]: store-driven refresh of
//!     the surprise cache and OpSpec catalog
//!
//! The `attune` binary exposes these as `inject`, `consolidate`, `backfill`
//! and `check-key`.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backfill;
pub mod consolidator;
pub mod embeddings;
pub mod error;
pub mod invalidation;
pub mod metrics;
pub mod pipeline;
pub mod runtime;
pub mod surprise;
pub mod telemetry;

pub use consolidator::{ConflictCheck, MemoryConsolidator, ScanProgress, ScanReport};
pub use error::{PipelineError, Result};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{ContextPipeline, ContextResult, StageSkip};
pub use runtime::AttuneRuntime;
pub use surprise::{SurpriseBatch, SurpriseScorer};
