//! Key/value stores that hold the persisted translation cache.
//! `SqliteStore` is the production backend; `MemoryStore` backs tests and
//! ephemeral runs. Both can enforce a byte quota, reported as
//! `StoreError::QuotaExceeded` so the cache can evict and retry.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Synchronous string key/value store.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    quota_bytes: Option<usize>,
    fail_writes: bool,
}

/// In-process store. The quota counts key and value bytes across all keys.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        let store = Self::default();
        store.set_quota(Some(quota_bytes));
        store
    }

    /// Change the quota. Existing values are kept even if they exceed it.
    pub fn set_quota(&self, quota_bytes: Option<usize>) {
        self.inner.lock().quota_bytes = quota_bytes;
    }

    /// Make every write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().values.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(StoreError::Backend("writes disabled".into()));
        }
        if let Some(quota) = inner.quota_bytes {
            let others: usize = inner
                .values
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if others + key.len() + value.len() > quota {
                return Err(StoreError::QuotaExceeded);
            }
        }
        inner.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().values.remove(key);
        Ok(())
    }
}

/// SQLite-backed store. A quota is enforced through `max_page_count`, so a
/// write that would grow the file past it fails with `SQLITE_FULL`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, quota_bytes: Option<u64>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(backend)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(backend)?;

        if let Some(quota) = quota_bytes {
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(backend)?;
            let in_use: i64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .map_err(backend)?;
            let pages = (quota as i64 / page_size.max(1)).max(in_use);
            let applied: i64 = conn
                .pragma_update_and_check(None, "max_page_count", pages, |row| row.get(0))
                .map_err(backend)?;
            debug!(page_size, pages = applied, "sqlite quota applied");
        }

        info!(path = %path.display(), "sqlite cache store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl CacheStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .lock()
            .query_row("SELECT value FROM kv_store WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(backend)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now_unix()],
            )
            .map(|_| ())
            .map_err(classify)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .map(|_| ())
            .map_err(classify)
    }
}

fn classify(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::DiskFull => StoreError::QuotaExceeded,
        _ => backend(e),
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_enforces_quota() {
        let store = MemoryStore::with_quota(20);
        store.set("k", "0123456789").unwrap();
        assert_eq!(store.set("j", "0123456789"), Err(StoreError::QuotaExceeded));
        // Replacing a key only counts the new value.
        store.set("k", "0123456789abcdef").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("0123456789abcdef"));

        store.set_quota(None);
        store.set("j", "0123456789").unwrap();
        assert_eq!(store.used_bytes(), 17 + 11);
    }

    #[test]
    fn memory_store_write_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.set("k", "v"), Err(StoreError::Backend(_))));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn sqlite_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let store = SqliteStore::open(&path, None).unwrap();
            store.set("translationCache", "{}").unwrap();
            store.set("preferredLanguage", "hi-IN").unwrap();
            store.remove("translationCache").unwrap();
        }
        let store = SqliteStore::open(&path, None).unwrap();
        assert_eq!(store.get("translationCache").unwrap(), None);
        assert_eq!(store.get("preferredLanguage").unwrap().as_deref(), Some("hi-IN"));
    }

    #[test]
    fn sqlite_quota_surfaces_as_quota_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("small.db"), Some(64 * 1024)).unwrap();
        store.set("small", "fits").unwrap();

        let big = "x".repeat(512 * 1024);
        assert_eq!(store.set("big", &big), Err(StoreError::QuotaExceeded));
        assert_eq!(store.get("small").unwrap().as_deref(), Some("fits"));
        assert_eq!(store.get("big").unwrap(), None);
    }
}
