//! Store-driven refresh of derived state.
//!
//! Two well-known keys drive it:
//! - a write to [`CONSOLIDATION_EVENT_KEY`] clears the surprise cache;
//! - a write to [`OPSPEC_CATALOG_KEY`] reloads the router catalog (a
//!   delete restores the built-in catalog).
//!
//! Any other transport (IPC, HTTP hook, ...) can call
//! [`InvalidationSink::invalidate_all`] directly instead.

use std::sync::Arc;

use attune_core::opspec::{OpSpecModule, OpSpecRouter, default_catalog};
use attune_core::storage::{ChangeKind, KvStore, StoreChange};
use attune_core::surprise::InvalidationSink;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Written by the consolidator after every resolution.
pub const CONSOLIDATION_EVENT_KEY: &str = "events/consolidation";

/// Holds the OpSpec module catalog as a JSON array.
pub const OPSPEC_CATALOG_KEY: &str = "opspec/modules";

/// Watch `store` and keep `cache` and `router` in sync with it.
///
/// The task ends when the store's change channel closes. If the listener
/// falls behind and misses changes, it clears the cache, since one of the
/// missed changes may have been a consolidation.
pub fn spawn_invalidation_listener(
    store: Arc<dyn KvStore>,
    cache: Arc<dyn InvalidationSink>,
    router: Arc<OpSpecRouter>,
) -> JoinHandle<()> {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => handle_change(store.as_ref(), cache.as_ref(), &router, &change).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation listener lagged, clearing surprise cache");
                    cache.invalidate_all();
                }
                Err(RecvError::Closed) => {
                    debug!("store change channel closed, invalidation listener exiting");
                    break;
                }
            }
        }
    })
}

async fn handle_change(store: &dyn KvStore, cache: &dyn InvalidationSink, router: &OpSpecRouter, change: &StoreChange) {
    match change.key.as_str() {
        CONSOLIDATION_EVENT_KEY if change.kind == ChangeKind::Set => {
            cache.invalidate_all();
            debug!("consolidation event, surprise cache cleared");
        }
        OPSPEC_CATALOG_KEY => match change.kind {
            ChangeKind::Deleted => {
                router.replace_catalog(default_catalog());
                info!("opspec catalog removed, built-in catalog restored");
            }
            ChangeKind::Set => reload_catalog(store, router).await,
        },
        _ => {}
    }
}

async fn reload_catalog(store: &dyn KvStore, router: &OpSpecRouter) {
    let value = match store.get(OPSPEC_CATALOG_KEY).await {
        Ok(Some(value)) => value,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "failed to read opspec catalog, keeping current one");
            return;
        }
    };
    match serde_json::from_value::<Vec<OpSpecModule>>(value) {
        Ok(modules) => {
            info!(modules = modules.len(), "opspec catalog reloaded");
            router.replace_catalog(modules);
        }
        Err(e) => warn!(error = %e, "malformed opspec catalog, keeping current one"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attune_core::storage::InMemoryStore;
    use attune_core::surprise::SurpriseCache;
    use attune_core::types::MemoryId;
    use serde_json::json;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn consolidation_event_clears_cache() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 10, 10));
        let router = Arc::new(OpSpecRouter::with_default_catalog());
        let handle = spawn_invalidation_listener(Arc::clone(&store), cache.clone(), router);

        cache.insert(MemoryId::new(), 1, 0.42);
        store.set("memory/unrelated", json!({})).await.expect("set");
        settle().await;
        assert_eq!(cache.len(), 1);

        store.set(CONSOLIDATION_EVENT_KEY, json!({"n": 1})).await.expect("set");
        settle().await;
        assert!(cache.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn catalog_key_reloads_and_delete_restores() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 10, 10));
        let router = Arc::new(OpSpecRouter::with_default_catalog());
        let builtin = router.len();
        let handle = spawn_invalidation_listener(Arc::clone(&store), cache, Arc::clone(&router));

        store
            .set(
                OPSPEC_CATALOG_KEY,
                json!([{ "id": "only", "priority": 0, "content": "Be kind." }]),
            )
            .await
            .expect("set");
        settle().await;
        assert_eq!(router.len(), 1);
        assert_eq!(router.route("hello").content, "Be kind.");

        store.delete(OPSPEC_CATALOG_KEY).await.expect("delete");
        settle().await;
        assert_eq!(router.len(), builtin);
        handle.abort();
    }

    #[tokio::test]
    async fn malformed_catalog_keeps_current() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = Arc::new(SurpriseCache::new(Duration::from_secs(300), 10, 10));
        let router = Arc::new(OpSpecRouter::with_default_catalog());
        let builtin = router.len();
        let handle = spawn_invalidation_listener(Arc::clone(&store), cache, Arc::clone(&router));

        store.set(OPSPEC_CATALOG_KEY, json!({"not": "a list"})).await.expect("set");
        settle().await;
        assert_eq!(router.len(), builtin);
        handle.abort();
    }
}
