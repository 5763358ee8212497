//! Key-value persistence collaborator.
//!
//! The pipeline treats storage as named JSON records with get/set/delete
//! and a change-notification channel. Two implementations:
//!
//! - [`InMemoryStore`]: a lock-guarded map, for tests and ephemeral runs.
//! - [`SqliteStore`]: one `kv` table in SQLite:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS kv (
//!     key        TEXT PRIMARY KEY,
//!     value      TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! ```
//!
//! Both publish a [`StoreChange`] after every successful write, and both
//! run [`KvStore::update`] so that no other write to the key can land
//! between its read and its write.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{AttuneError, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or overwritten.
    Set,
    /// Removed.
    Deleted,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// The key that changed.
    pub key: String,
    /// How it changed.
    pub kind: ChangeKind,
}

/// Read-modify-write step for [`KvStore::update`].
///
/// Receives the current value and returns the value to store, or `None`
/// to leave the record as it is. An error aborts the update unwritten.
pub type UpdateFn = Box<dyn FnOnce(Option<Value>) -> Result<Option<Value>> + Send>;

/// What [`KvStore::update`] saw and left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Updated {
    /// Value before the update.
    pub before: Option<Value>,
    /// Value stored after the update.
    pub after: Option<Value>,
    /// Whether anything was written.
    pub written: bool,
}

/// Async key-value store of JSON records.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a record.
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    /// Write a record.
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    /// Atomically read, transform and write one record.
    async fn update(&self, key: &str, f: UpdateFn) -> Result<Updated>;
    /// Delete a record. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

fn notify(tx: &broadcast::Sender<StoreChange>, key: &str, kind: ChangeKind) {
    // No receivers is fine.
    let _ = tx.send(StoreChange {
        key: key.to_string(),
        kind,
    });
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Map-backed store.
#[derive(Debug)]
pub struct InMemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            changes,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        notify(&self.changes, key, ChangeKind::Set);
        Ok(())
    }

    async fn update(&self, key: &str, f: UpdateFn) -> Result<Updated> {
        let updated = {
            let mut data = self.data.write();
            let before = data.get(key).cloned();
            match f(before.clone())? {
                Some(next) => {
                    data.insert(key.to_string(), next.clone());
                    Updated {
                        before,
                        after: Some(next),
                        written: true,
                    }
                }
                None => Updated {
                    after: before.clone(),
                    before,
                    written: false,
                },
            }
        };
        if updated.written {
            notify(&self.changes, key, ChangeKind::Set);
        }
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.data.write().remove(key).is_some();
        if existed {
            notify(&self.changes, key, ChangeKind::Deleted);
        }
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);";

/// SQLite-backed store.
///
/// Statements run on the blocking pool under a mutex; `update` runs inside
/// an immediate transaction so other processes sharing the file are
/// serialized too.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    changes: broadcast::Sender<StoreChange>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database at `path`.
    ///
    /// # Errors
    /// Returns [`AttuneError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, wal_mode: bool) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), wal = wal_mode, "kv store opened");
        Ok(Self::from_connection(conn, db_path))
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// Returns [`AttuneError::Database`] on SQLite failures.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            changes,
        }
    }

    /// Copy the database to `dest` with SQLite's online-backup API.
    ///
    /// # Errors
    /// Returns [`AttuneError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let start = Instant::now();
        let mut target = Connection::open(dest.as_ref())?;
        let conn = self.conn.lock();
        let backup = rusqlite::backup::Backup::new(&conn, &mut target)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(10), None)?;
        info!(
            dest = %dest.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "kv store backup completed"
        );
        Ok(())
    }

    /// Path of the database file (`:memory:` for in-memory databases).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut *conn.lock()))
            .await
            .map_err(|e| AttuneError::Storage(format!("storage task failed: {e}")))?
    }
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .prepare_cached("SELECT value FROM kv WHERE key = ?1")?
        .query_row(params![key], |row| row.get(0))
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(AttuneError::from))
        .transpose()
}

fn write_value(conn: &Connection, key: &str, value: &Value) -> Result<usize> {
    let json = serde_json::to_string(value)?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, json, now],
    )?;
    Ok(json.len())
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| read_value(conn, &key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let owned = key.to_string();
        let bytes = self.with_conn(move |conn| write_value(conn, &owned, &value)).await?;
        debug!(key, bytes, "kv set");
        notify(&self.changes, key, ChangeKind::Set);
        Ok(())
    }

    async fn update(&self, key: &str, f: UpdateFn) -> Result<Updated> {
        let owned = key.to_string();
        let updated = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let before = read_value(&tx, &owned)?;
                let updated = match f(before.clone())? {
                    Some(next) => {
                        write_value(&tx, &owned, &next)?;
                        Updated {
                            before,
                            after: Some(next),
                            written: true,
                        }
                    }
                    None => Updated {
                        after: before.clone(),
                        before,
                        written: false,
                    },
                };
                tx.commit()?;
                Ok(updated)
            })
            .await?;
        if updated.written {
            debug!(key, "kv update");
            notify(&self.changes, key, ChangeKind::Set);
        }
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let owned = key.to_string();
        let deleted = self
            .with_conn(move |conn| Ok(conn.execute("DELETE FROM kv WHERE key = ?1", params![owned])?))
            .await?;
        if deleted > 0 {
            notify(&self.changes, key, ChangeKind::Deleted);
        }
        Ok(deleted > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT key FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
            let len = i64::try_from(prefix.len()).map_err(|e| AttuneError::Storage(e.to_string()))?;
            let rows = stmt.query_map(params![prefix, len], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Open the store described by the `[storage]` config section.
///
/// # Errors
/// Returns [`AttuneError::Config`] for an unknown backend, or the
/// backend's open error.
pub fn open_store(config: &StorageConfig) -> Result<std::sync::Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "memory" => Ok(std::sync::Arc::new(InMemoryStore::new())),
        "sqlite" => Ok(std::sync::Arc::new(SqliteStore::open(&config.path, config.wal_mode)?)),
        other => Err(AttuneError::Config(format!("unknown storage backend: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn exercise(store: &dyn KvStore) {
        let mut rx = store.subscribe();
        assert_eq!(store.get("settings").await.expect("get"), None);

        store.set("memory/b", json!({"x": 2})).await.expect("set");
        store.set("memory/a", json!({"x": 1})).await.expect("set");
        store.set("settings", json!({"theme": "dark"})).await.expect("set");
        assert_eq!(store.get("memory/a").await.expect("get"), Some(json!({"x": 1})));
        assert_eq!(
            store.keys("memory/").await.expect("keys"),
            vec!["memory/a".to_string(), "memory/b".to_string()]
        );

        assert!(store.delete("memory/a").await.expect("delete"));
        assert!(!store.delete("memory/a").await.expect("delete"));

        let first = rx.recv().await.expect("change");
        assert_eq!(first.key, "memory/b");
        assert_eq!(first.kind, ChangeKind::Set);
        let mut last = first;
        while let Ok(change) = rx.try_recv() {
            last = change;
        }
        assert_eq!(last.key, "memory/a");
        assert_eq!(last.kind, ChangeKind::Deleted);
    }

    fn increment() -> UpdateFn {
        Box::new(|current: Option<Value>| -> Result<Option<Value>> {
            let n = current.as_ref().and_then(Value::as_u64).unwrap_or(0);
            Ok(Some(json!(n + 1)))
        })
    }

    async fn exercise_update(store: Arc<dyn KvStore>) {
        let skipped = store
            .update("missing", Box::new(|current: Option<Value>| -> Result<Option<Value>> {
                assert!(current.is_none());
                Ok(None)
            }))
            .await
            .expect("update");
        assert!(!skipped.written);
        assert_eq!(store.get("missing").await.expect("get"), None);

        let failed = store
            .update("counter", Box::new(|_: Option<Value>| -> Result<Option<Value>> { Err(AttuneError::Storage("refused".into())) }))
            .await;
        assert!(failed.is_err());
        assert_eq!(store.get("counter").await.expect("get"), None);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.update("counter", increment()).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("update");
        }
        assert_eq!(store.get("counter").await.expect("get"), Some(json!(32)));

        let last = store.update("counter", increment()).await.expect("update");
        assert_eq!(last.before, Some(json!(32)));
        assert_eq!(last.after, Some(json!(33)));
        assert!(last.written);
    }

    #[tokio::test]
    async fn in_memory_store_contract() {
        exercise(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        exercise(&SqliteStore::open_in_memory().expect("open")).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_memory_updates_do_not_lose_writes() {
        exercise_update(Arc::new(InMemoryStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_updates_do_not_lose_writes() {
        exercise_update(Arc::new(SqliteStore::open_in_memory().expect("open"))).await;
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kv.db");
        {
            let store = SqliteStore::open(&path, true).expect("open");
            store.set("k", json!([1, 2, 3])).await.expect("set");
        }
        let store = SqliteStore::open(&path, true).expect("reopen");
        assert_eq!(store.get("k").await.expect("get"), Some(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn sqlite_backup_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open_in_memory().expect("open");
        store.set("k", json!("v")).await.expect("set");
        let dest = dir.path().join("backup.db");
        store.backup(&dest).expect("backup");
        let restored = SqliteStore::open(&dest, false).expect("open backup");
        assert_eq!(restored.get("k").await.expect("get"), Some(json!("v")));
    }

    #[test]
    fn unknown_backend_is_config_error() {
        let cfg = StorageConfig {
            backend: "redis".into(),
            ..StorageConfig::default()
        };
        assert!(matches!(open_store(&cfg), Err(AttuneError::Config(_))));
    }
}
