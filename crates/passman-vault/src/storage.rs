//! Key/value storage tiers.
//!
//! Key material and session metadata are kept in one of two tiers, both
//! reached through the [`KeyValueStore`] trait:
//!
//! - **Ephemeral** ([`MemoryStore`]): scoped to one tab/view. A clone of the
//!   handle is the same tab after a reload; a fresh instance is a new tab.
//! - **Persistent** ([`SqliteStore`]): scoped to the device profile. Every
//!   handle opened on the same file sees the same data, which is how
//!   independent execution contexts share the activity timestamp and the
//!   biometric escrow record.
//!
//! Neither tier is transactional. Callers treat every read as possibly absent
//! or corrupted, and writes are plain upserts (last write wins).

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A string key/value store with no transactional guarantees.
///
/// Implementations must be `Send + Sync` so handles can be shared across
/// async tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, or `None` if it was never written or has
    /// been removed.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write (or overwrite) the value under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Ephemeral tier
// ---------------------------------------------------------------------------

/// In-memory store backing the tab-scoped ephemeral tier.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistent tier
// ---------------------------------------------------------------------------

/// SQLite-backed store for the device-scoped persistent tier.
///
/// The connection sits behind an `Arc<Mutex<>>` and every query runs on the
/// blocking pool via `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the file cannot be opened, or
    /// [`VaultError::MigrationFailed`] if the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening device store");

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        // WAL plus a busy timeout lets several contexts hold the same file.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        tracing::debug!("running device store migrations");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| VaultError::MigrationFailed {
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| VaultError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now().timestamp();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_crud() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_clone_shares_entries() {
        let tab = MemoryStore::new();
        let reloaded = tab.clone();
        tab.set("k", "v").await.unwrap();
        assert_eq!(reloaded.get("k").await.unwrap().as_deref(), Some("v"));

        let other_tab = MemoryStore::new();
        assert_eq!(other_tab.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_store_crud_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_store_is_shared_across_handles_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");

        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        first.set("last_activity_at", "a").await.unwrap();
        assert_eq!(
            second.get("last_activity_at").await.unwrap().as_deref(),
            Some("a")
        );

        second.set("last_activity_at", "b").await.unwrap();
        assert_eq!(
            first.get("last_activity_at").await.unwrap().as_deref(),
            Some("b")
        );
    }
}
