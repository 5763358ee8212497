//! Memory records on top of a [`KvStore`].
//!
//! Each memory lives under `memory/<uuid>` as JSON. Records that fail to
//! decode are skipped with a warning; one bad record never takes the
//! whole list down.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AttuneError, Result};
use crate::storage::KvStore;
use crate::types::{Embedding, Memory, MemoryId, ValidationState};

/// Key prefix for memory records.
pub const MEMORY_PREFIX: &str = "memory/";

/// Storage key of a memory.
#[must_use]
pub fn memory_key(id: MemoryId) -> String {
    format!("{MEMORY_PREFIX}{id}")
}

/// A consolidation write: one new record plus the records it retires.
///
/// Applied as a unit by [`MemoryRepository::apply_resolution`].
#[derive(Debug, Clone)]
pub struct ResolutionWrite {
    /// The consolidated record to add.
    pub new_record: Memory,
    /// Records contradicted by the new one; moved to `invalidated`.
    pub invalidate: Vec<MemoryId>,
    /// The candidate that was folded into the new record; moved to `outdated`.
    pub outdate: Option<MemoryId>,
}

/// What [`MemoryRepository::apply_resolution`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionReceipt {
    /// Id of the new record.
    pub new_record: MemoryId,
    /// Ids moved to `invalidated`.
    pub invalidated: Vec<MemoryId>,
    /// Id moved to `outdated`, if any.
    pub outdated: Option<MemoryId>,
}

/// Typed access to memory records.
#[derive(Clone)]
pub struct MemoryRepository {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRepository").finish_non_exhaustive()
    }
}

impl MemoryRepository {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Load one memory. Malformed records read as absent.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn get(&self, id: MemoryId) -> Result<Option<Memory>> {
        let key = memory_key(id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(memory) => Ok(Some(memory)),
            Err(e) => {
                warn!(%key, error = %e, "skipping malformed memory record");
                Ok(None)
            }
        }
    }

    /// Insert or overwrite a memory.
    ///
    /// # Errors
    /// Propagates serialization and store failures.
    pub async fn put(&self, memory: &Memory) -> Result<()> {
        let value = serde_json::to_value(memory)?;
        self.store.set(&memory_key(memory.id), value).await
    }

    /// All decodable memories, oldest first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list(&self) -> Result<Vec<Memory>> {
        let keys = self.store.keys(MEMORY_PREFIX).await?;
        let mut memories = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(value) = self.store.get(&key).await? else {
                // Deleted between keys() and get().
                continue;
            };
            match serde_json::from_value::<Memory>(value) {
                Ok(m) => memories.push(m),
                Err(e) => warn!(%key, error = %e, "skipping malformed memory record"),
            }
        }
        memories.sort_by_key(|m| m.created_at);
        Ok(memories)
    }

    /// Non-retired memories.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_active(&self) -> Result<Vec<Memory>> {
        let mut all = self.list().await?;
        all.retain(Memory::is_active);
        Ok(all)
    }

    /// Up to `limit` memories in `state`, oldest first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_by_state(&self, state: ValidationState, limit: usize) -> Result<Vec<Memory>> {
        let mut all = self.list().await?;
        all.retain(|m| m.validation == state);
        all.truncate(limit);
        Ok(all)
    }

    /// Move a memory to `next`, enforcing the lifecycle rule.
    ///
    /// # Errors
    /// [`AttuneError::MemoryNotFound`], [`AttuneError::InvalidTransition`],
    /// or store failures.
    pub async fn transition(&self, id: MemoryId, next: ValidationState, now: DateTime<Utc>) -> Result<Memory> {
        let (_, memory) = self.move_to(id, next, now).await?;
        debug!(memory_id = %id, state = %next, "memory transitioned");
        Ok(memory)
    }

    /// Record that memories were surfaced. Missing ids are ignored.
    /// Returns how many records were updated.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn record_access(&self, ids: &[MemoryId], now: DateTime<Utc>) -> Result<usize> {
        let mut updated = 0;
        for id in ids {
            let touched = self
                .modify(*id, move |m| {
                    m.record_access(now);
                    Ok(true)
                })
                .await?;
            if touched.is_some() {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Attach an embedding, leaving every other field as stored.
    /// Returns `false` if the memory is gone.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn set_embedding(&self, id: MemoryId, embedding: Embedding) -> Result<bool> {
        let touched = self
            .modify(id, move |m| {
                m.embedding = Some(embedding);
                Ok(true)
            })
            .await?;
        Ok(touched.is_some())
    }

    /// Apply a consolidation write as one logical unit.
    ///
    /// Every retirement is checked before anything is written, so lifecycle
    /// violations fail cleanly, and checked again inside the store update
    /// that applies it. If a retirement fails midway, already applied
    /// writes are rolled back on a best-effort basis. A complete rollback
    /// after losing a race to another writer returns that lifecycle error;
    /// anything else is [`AttuneError::PartialResolution`] describing what
    /// is left in the store.
    ///
    /// # Errors
    /// See above.
    pub async fn apply_resolution(&self, write: ResolutionWrite, now: DateTime<Utc>) -> Result<ResolutionReceipt> {
        let new_id = write.new_record.id;

        let mut targets: Vec<(MemoryId, ValidationState)> = Vec::new();
        let listed = write
            .invalidate
            .iter()
            .map(|id| (*id, ValidationState::Invalidated))
            .chain(write.outdate.map(|id| (id, ValidationState::Outdated)));
        for (id, next) in listed {
            if !targets.iter().any(|(t, _)| *t == id) {
                targets.push((id, next));
            }
        }
        for (id, next) in &targets {
            let memory = self.get(*id).await?.ok_or(AttuneError::MemoryNotFound(*id))?;
            check_transition(&memory, *next)?;
        }

        self.put(&write.new_record).await?;

        let mut applied: Vec<Retirement> = Vec::new();
        for (idx, (id, next)) in targets.iter().enumerate() {
            match self.move_to(*id, *next, now).await {
                Ok((prior, _)) => applied.push(Retirement {
                    id: *id,
                    prior: prior.validation,
                    prior_updated_at: prior.updated_at,
                    state: *next,
                }),
                Err(e) => return Err(self.compensate(new_id, now, &applied, &targets[idx..], e).await),
            }
        }

        let receipt = ResolutionReceipt {
            new_record: new_id,
            invalidated: targets
                .iter()
                .filter(|(_, s)| *s == ValidationState::Invalidated)
                .map(|(id, _)| *id)
                .collect(),
            outdated: targets
                .iter()
                .find(|(_, s)| *s == ValidationState::Outdated)
                .map(|(id, _)| *id),
        };
        debug!(
            new_record = %new_id,
            invalidated = receipt.invalidated.len(),
            outdated = receipt.outdated.is_some(),
            "resolution applied"
        );
        Ok(receipt)
    }

    /// Checked lifecycle move. Returns the record before and after.
    async fn move_to(&self, id: MemoryId, next: ValidationState, now: DateTime<Utc>) -> Result<(Memory, Memory)> {
        self.modify(id, move |m| {
            check_transition(m, next)?;
            m.validation = next;
            m.updated_at = now;
            Ok(true)
        })
        .await?
        .ok_or(AttuneError::MemoryNotFound(id))
    }

    /// Edit one memory under the store's atomic update.
    ///
    /// `edit` sees the stored record and returns whether to write it back.
    /// Yields the record before and after, or `None` when it is missing or
    /// malformed.
    async fn modify<F>(&self, id: MemoryId, edit: F) -> Result<Option<(Memory, Memory)>>
    where
        F: FnOnce(&mut Memory) -> Result<bool> + Send + 'static,
    {
        let key = memory_key(id);
        let updated = self
            .store
            .update(
                &key,
                Box::new(move |current: Option<Value>| -> Result<Option<Value>> {
                    let Some(Ok(mut memory)) = current.map(serde_json::from_value::<Memory>) else {
                        return Ok(None);
                    };
                    if edit(&mut memory)? {
                        Ok(Some(serde_json::to_value(&memory)?))
                    } else {
                        Ok(None)
                    }
                }),
            )
            .await?;
        let decode = |v: Option<Value>| v.and_then(|v| serde_json::from_value::<Memory>(v).ok());
        let had_record = updated.before.is_some();
        match (decode(updated.before), decode(updated.after)) {
            (Some(before), Some(after)) => Ok(Some((before, after))),
            _ => {
                if had_record {
                    warn!(%key, "skipping malformed memory record");
                }
                Ok(None)
            }
        }
    }

    /// Roll back a half-applied resolution and describe what remains.
    async fn compensate(
        &self,
        new_id: MemoryId,
        now: DateTime<Utc>,
        applied: &[Retirement],
        remaining: &[(MemoryId, ValidationState)],
        cause: AttuneError,
    ) -> AttuneError {
        let mut still_retired = Vec::new();
        for retirement in applied {
            let r = *retirement;
            // Only undo the retirement this resolution wrote.
            let undone = self
                .modify(r.id, move |m| {
                    if m.validation != r.state || m.updated_at != now {
                        return Ok(false);
                    }
                    m.validation = r.prior;
                    m.updated_at = r.prior_updated_at;
                    Ok(true)
                })
                .await;
            if let Err(e) = undone {
                warn!(memory_id = %r.id, error = %e, "rollback of retirement failed");
                still_retired.push(r.id);
            }
        }
        let new_record_written = match self.store.delete(&memory_key(new_id)).await {
            Ok(_) => false,
            Err(e) => {
                warn!(memory_id = %new_id, error = %e, "rollback of consolidated record failed");
                true
            }
        };

        let lost_race = matches!(
            cause,
            AttuneError::InvalidTransition { .. } | AttuneError::MemoryNotFound(_)
        );
        if lost_race && still_retired.is_empty() && !new_record_written {
            debug!(new_record = %new_id, error = %cause, "resolution rolled back after a concurrent change");
            return cause;
        }

        let mut pending: Vec<MemoryId> = remaining.iter().map(|(id, _)| *id).collect();
        pending.extend(applied.iter().map(|r| r.id).filter(|id| !still_retired.contains(id)));
        AttuneError::PartialResolution {
            new_record: new_id,
            new_record_written,
            invalidated: still_retired,
            pending,
            reason: cause.to_string(),
        }
    }
}

/// A retirement written by [`MemoryRepository::apply_resolution`].
#[derive(Debug, Clone, Copy)]
struct Retirement {
    id: MemoryId,
    prior: ValidationState,
    prior_updated_at: DateTime<Utc>,
    state: ValidationState,
}

fn check_transition(memory: &Memory, next: ValidationState) -> Result<()> {
    if memory.validation.can_transition_to(next) {
        Ok(())
    } else {
        Err(AttuneError::InvalidTransition {
            id: memory.id,
            from: memory.validation,
            to: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, StoreChange, UpdateFn, Updated};
    use crate::types::{LifeDomain, MemoryCategory};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::sync::broadcast;

    fn memory(content: &str, state: ValidationState) -> Memory {
        Memory::new(content, MemoryCategory::Fact, LifeDomain::Work, 0.3, Utc::now()).with_validation(state)
    }

    fn repo() -> MemoryRepository {
        MemoryRepository::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn put_get_list() {
        let repo = repo();
        let a = memory("a", ValidationState::Untested);
        let b = memory("b", ValidationState::Provisional);
        repo.put(&a).await.expect("put");
        repo.put(&b).await.expect("put");
        assert_eq!(repo.get(a.id).await.expect("get"), Some(a.clone()));
        assert_eq!(repo.list().await.expect("list").len(), 2);
        let provisional = repo
            .list_by_state(ValidationState::Provisional, 10)
            .await
            .expect("list");
        assert_eq!(provisional, vec![b]);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let repo = MemoryRepository::new(store.clone());
        let good = memory("good", ValidationState::Untested);
        repo.put(&good).await.expect("put");
        store
            .set(&memory_key(MemoryId::new()), json!({"content": 42}))
            .await
            .expect("set");
        assert_eq!(repo.list().await.expect("list"), vec![good]);
    }

    #[tokio::test]
    async fn transition_enforces_lifecycle() {
        let repo = repo();
        let m = memory("m", ValidationState::Invalidated);
        repo.put(&m).await.expect("put");
        let err = repo
            .transition(m.id, ValidationState::Validated, Utc::now())
            .await
            .expect_err("retired is terminal");
        assert!(matches!(err, AttuneError::InvalidTransition { .. }));
        let missing = repo
            .transition(MemoryId::new(), ValidationState::Validated, Utc::now())
            .await
            .expect_err("missing");
        assert!(matches!(missing, AttuneError::MemoryNotFound(_)));
    }

    #[tokio::test]
    async fn record_access_bumps_counters() {
        let repo = repo();
        let m = memory("m", ValidationState::Untested);
        repo.put(&m).await.expect("put");
        let n = repo
            .record_access(&[m.id, MemoryId::new()], Utc::now())
            .await
            .expect("access");
        assert_eq!(n, 1);
        let loaded = repo.get(m.id).await.expect("get").expect("present");
        assert_eq!(loaded.access_count, 1);
        assert!(loaded.last_accessed.is_some());
    }

    #[tokio::test]
    async fn resolution_writes_one_record_and_retires_listed_ids() {
        let repo = repo();
        let old = memory("works at Acme", ValidationState::Validated);
        let bystander = memory("likes tea", ValidationState::Validated);
        let candidate = memory("works at Globex now", ValidationState::Provisional);
        for m in [&old, &bystander, &candidate] {
            repo.put(m).await.expect("put");
        }
        let merged = memory("works at Globex (left Acme)", ValidationState::Consolidated);
        let receipt = repo
            .apply_resolution(
                ResolutionWrite {
                    new_record: merged.clone(),
                    invalidate: vec![old.id],
                    outdate: Some(candidate.id),
                },
                Utc::now(),
            )
            .await
            .expect("apply");

        assert_eq!(receipt.invalidated, vec![old.id]);
        assert_eq!(receipt.outdated, Some(candidate.id));
        let all = repo.list().await.expect("list");
        assert_eq!(all.len(), 4);
        let state = |id| all.iter().find(|m| m.id == id).map(|m| m.validation);
        assert_eq!(state(old.id), Some(ValidationState::Invalidated));
        assert_eq!(state(bystander.id), Some(ValidationState::Validated));
        assert_eq!(state(candidate.id), Some(ValidationState::Outdated));
        assert_eq!(state(merged.id), Some(ValidationState::Consolidated));
    }

    #[tokio::test]
    async fn resolution_preflight_failure_writes_nothing() {
        let repo = repo();
        let retired = memory("old", ValidationState::Outdated);
        repo.put(&retired).await.expect("put");
        let merged = memory("new", ValidationState::Consolidated);
        let err = repo
            .apply_resolution(
                ResolutionWrite {
                    new_record: merged.clone(),
                    invalidate: vec![retired.id],
                    outdate: None,
                },
                Utc::now(),
            )
            .await
            .expect_err("terminal state");
        assert!(matches!(err, AttuneError::InvalidTransition { .. }));
        assert_eq!(repo.get(merged.id).await.expect("get"), None);
    }

    /// Store whose writes to one key always fail.
    struct FailingStore {
        inner: InMemoryStore,
        poisoned: Mutex<Option<String>>,
    }

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Value) -> Result<()> {
            let poisoned = self.poisoned.lock().as_deref() == Some(key);
            if poisoned {
                return Err(AttuneError::Storage("disk full".into()));
            }
            self.inner.set(key, value).await
        }
        async fn update(&self, key: &str, f: UpdateFn) -> Result<Updated> {
            let poisoned = self.poisoned.lock().as_deref() == Some(key);
            if poisoned {
                return Err(AttuneError::Storage("disk full".into()));
            }
            self.inner.update(key, f).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.keys(prefix).await
        }
        fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn failed_invalidation_is_partial_resolution_and_rolled_back() {
        let store = Arc::new(FailingStore {
            inner: InMemoryStore::new(),
            poisoned: Mutex::new(None),
        });
        let repo = MemoryRepository::new(store.clone());
        let first = memory("first", ValidationState::Validated);
        let second = memory("second", ValidationState::Validated);
        repo.put(&first).await.expect("put");
        repo.put(&second).await.expect("put");
        *store.poisoned.lock() = Some(memory_key(second.id));

        let merged = memory("merged", ValidationState::Consolidated);
        let err = repo
            .apply_resolution(
                ResolutionWrite {
                    new_record: merged.clone(),
                    invalidate: vec![first.id, second.id],
                    outdate: None,
                },
                Utc::now(),
            )
            .await
            .expect_err("partial");

        match err {
            AttuneError::PartialResolution {
                new_record,
                new_record_written,
                invalidated,
                pending,
                ..
            } => {
                assert_eq!(new_record, merged.id);
                assert!(!new_record_written);
                assert!(invalidated.is_empty());
                assert_eq!(pending.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(repo.get(merged.id).await.expect("get"), None);
        let first_now = repo.get(first.id).await.expect("get").expect("present");
        assert_eq!(first_now.validation, ValidationState::Validated);
    }

    /// Store where another writer lands on one key right after the first
    /// read of it, whether that read is a plain `get` or an `update`.
    struct RacingStore {
        inner: InMemoryStore,
        landing: Mutex<Option<(String, Value)>>,
    }

    impl RacingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                landing: Mutex::new(None),
            }
        }

        fn land_on(&self, memory: &Memory) {
            let value = serde_json::to_value(memory).expect("encode");
            *self.landing.lock() = Some((memory_key(memory.id), value));
        }

        async fn maybe_land(&self, key: &str) {
            let due = {
                let mut landing = self.landing.lock();
                if landing.as_ref().is_some_and(|(k, _)| k == key) {
                    landing.take()
                } else {
                    None
                }
            };
            if let Some((k, v)) = due {
                self.inner.set(&k, v).await.expect("concurrent write");
            }
        }
    }

    #[async_trait]
    impl KvStore for RacingStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            let seen = self.inner.get(key).await;
            self.maybe_land(key).await;
            seen
        }
        async fn set(&self, key: &str, value: Value) -> Result<()> {
            self.inner.set(key, value).await
        }
        async fn update(&self, key: &str, f: UpdateFn) -> Result<Updated> {
            self.maybe_land(key).await;
            self.inner.update(key, f).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.keys(prefix).await
        }
        fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn access_bump_never_revives_a_concurrently_retired_memory() {
        let store = Arc::new(RacingStore::new());
        let repo = MemoryRepository::new(store.clone());
        let m = memory("works at Acme", ValidationState::Validated);
        repo.put(&m).await.expect("put");
        store.land_on(&m.clone().with_validation(ValidationState::Invalidated));

        let n = repo.record_access(&[m.id], Utc::now()).await.expect("access");

        assert_eq!(n, 1);
        let stored = repo.get(m.id).await.expect("get").expect("present");
        assert_eq!(stored.validation, ValidationState::Invalidated);
        assert_eq!(stored.access_count, 1);
    }

    #[tokio::test]
    async fn embedding_write_keeps_a_concurrent_retirement() {
        let store = Arc::new(RacingStore::new());
        let repo = MemoryRepository::new(store.clone());
        let m = memory("likes tea", ValidationState::Provisional);
        repo.put(&m).await.expect("put");
        store.land_on(&m.clone().with_validation(ValidationState::Outdated));

        assert!(repo.set_embedding(m.id, Embedding(vec![0.5, 0.5])).await.expect("embed"));

        let stored = repo.get(m.id).await.expect("get").expect("present");
        assert_eq!(stored.validation, ValidationState::Outdated);
        assert_eq!(stored.embedding, Some(Embedding(vec![0.5, 0.5])));
        assert!(!repo.set_embedding(MemoryId::new(), Embedding(vec![1.0])).await.expect("embed"));
    }

    #[tokio::test]
    async fn resolution_losing_a_race_is_rolled_back_cleanly() {
        let store = Arc::new(RacingStore::new());
        let repo = MemoryRepository::new(store.clone());
        let first = memory("lives in Lisbon", ValidationState::Validated);
        let contested = memory("rents a flat", ValidationState::Validated);
        repo.put(&first).await.expect("put");
        repo.put(&contested).await.expect("put");
        // Another resolution retires `contested` after our preflight read.
        store.land_on(&contested.clone().with_validation(ValidationState::Outdated));

        let merged = memory("lives in Porto", ValidationState::Consolidated);
        let err = repo
            .apply_resolution(
                ResolutionWrite {
                    new_record: merged.clone(),
                    invalidate: vec![first.id, contested.id],
                    outdate: None,
                },
                Utc::now(),
            )
            .await
            .expect_err("lost the race");

        assert!(matches!(err, AttuneError::InvalidTransition { .. }));
        assert_eq!(repo.get(merged.id).await.expect("get"), None);
        let state = |id| {
            let repo = repo.clone();
            async move { repo.get(id).await.expect("get").expect("present").validation }
        };
        assert_eq!(state(first.id).await, ValidationState::Validated);
        assert_eq!(state(contested.id).await, ValidationState::Outdated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_access_and_retirement_end_retired() {
        for _ in 0..20 {
            let repo = repo();
            let m = memory("has a standing desk", ValidationState::Validated);
            repo.put(&m).await.expect("put");
            let id = m.id;

            let bumps: Vec<_> = (0..8)
                .map(|_| {
                    let repo = repo.clone();
                    tokio::spawn(async move { repo.record_access(&[id], Utc::now()).await })
                })
                .collect();
            let retire = {
                let repo = repo.clone();
                tokio::spawn(async move { repo.transition(id, ValidationState::Invalidated, Utc::now()).await })
            };
            for bump in bumps {
                bump.await.expect("join").expect("access");
            }
            retire.await.expect("join").expect("retire");

            let stored = repo.get(id).await.expect("get").expect("present");
            assert_eq!(stored.validation, ValidationState::Invalidated);
            assert_eq!(stored.access_count, 8);
        }
    }
}
