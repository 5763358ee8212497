//! Embedding backfill.
//!
//! Memories are saved without vectors; this job fills them in. Work goes
//! out in fixed-size batches, each paced by the token-bucket budget. When
//! a whole batch fails, its records are retried one by one so a single bad
//! record cannot sink its neighbours; a record that still fails is listed
//! in the report and the job moves on.

use attune_core::embedding::EmbeddingProvider;
use attune_core::repository::MemoryRepository;
use attune_core::types::{Embedding, Memory, MemoryId};
use attune_llm::ratelimit::RateLimitBudget;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::PipelineMetrics;

/// Outcome of [`backfill_embeddings`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    /// Active memories that lacked an embedding.
    pub missing: usize,
    /// Embeddings written.
    pub embedded: usize,
    /// Batches sent.
    pub batches: usize,
    /// Records that failed, with the reason.
    pub failed: Vec<(MemoryId, String)>,
}

/// Embed every active memory that has no vector yet.
///
/// # Errors
/// Only if the memory list cannot be read; per-record failures are
/// reported, not returned.
pub async fn backfill_embeddings(
    repo: &MemoryRepository,
    embedder: &dyn EmbeddingProvider,
    budget: &RateLimitBudget,
    batch_size: usize,
    metrics: &PipelineMetrics,
) -> Result<BackfillReport> {
    let pending: Vec<Memory> = repo
        .list_active()
        .await?
        .into_iter()
        .filter(|m| m.embedding.is_none())
        .collect();
    let mut report = BackfillReport {
        missing: pending.len(),
        ..BackfillReport::default()
    };
    info!(missing = report.missing, model = embedder.model_name(), "embedding backfill started");

    for batch in pending.chunks(batch_size.max(1)) {
        report.batches += 1;
        budget.acquire().await;
        let texts: Vec<String> = batch.iter().map(|m| m.content.clone()).collect();
        match embedder.embed_batch(&texts).await {
            Ok(vectors) => {
                for (memory, vector) in batch.iter().zip(vectors) {
                    store(repo, memory, vector, &mut report, metrics).await;
                }
            }
            Err(e) => {
                warn!(batch = report.batches, size = batch.len(), error = %e, "batch failed, retrying records one by one");
                for memory in batch {
                    budget.acquire().await;
                    match embedder.embed(&memory.content).await {
                        Ok(vector) => store(repo, memory, vector, &mut report, metrics).await,
                        Err(e) => {
                            warn!(memory_id = %memory.id, error = %e, "embedding failed");
                            report.failed.push((memory.id, e.to_string()));
                        }
                    }
                }
            }
        }
        debug!(batch = report.batches, embedded = report.embedded, "batch done");
    }

    info!(
        embedded = report.embedded,
        failed = report.failed.len(),
        batches = report.batches,
        "embedding backfill finished"
    );
    Ok(report)
}

async fn store(
    repo: &MemoryRepository,
    memory: &Memory,
    vector: Embedding,
    report: &mut BackfillReport,
    metrics: &PipelineMetrics,
) {
    match repo.set_embedding(memory.id, vector).await {
        Ok(true) => {
            report.embedded += 1;
            PipelineMetrics::incr(&metrics.embeddings_backfilled);
        }
        // Deleted since the scan.
        Ok(false) => {}
        Err(e) => {
            warn!(memory_id = %memory.id, error = %e, "failed to store embedding");
            report.failed.push((memory.id, e.to_string()));
        }
    }
}
