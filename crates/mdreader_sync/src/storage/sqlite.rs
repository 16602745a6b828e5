//! SQLite-backed storage implementation.
//!
//! All keys live in a single `kv` table of one database file, so a snapshot
//! write is a single atomic statement.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use super::{StorageBackend, StorageInfo, StorageProvider, check_quota, entry_size};
use crate::BoxFuture;
use crate::error::Result;

/// SQLite-backed storage provider.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    quota: u64,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, quota: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, quota)
    }

    /// Create an in-memory SQLite database for testing.
    pub fn in_memory(quota: u64) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, quota)
    }

    fn with_connection(conn: Connection, quota: u64) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            quota,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn used(conn: &Connection) -> Result<u64> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(value)), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as u64)
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl StorageProvider for SqliteStorage {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Sqlite
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let conn = self.conn();
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    fn write<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let conn = self.conn();
            let old: Option<i64> = conn
                .query_row("SELECT LENGTH(value) FROM kv WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            let old = old
                .map(|len| entry_size(key, len.max(0) as usize))
                .unwrap_or(0);
            check_quota(
                Self::used(&conn)?,
                old,
                entry_size(key, value.len()),
                self.quota,
            )?;

            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let removed = self.conn().execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(removed > 0)
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let conn = self.conn();
            // substr comparison avoids LIKE wildcard escaping
            let mut stmt = conn.prepare(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map([prefix], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.conn().execute("DELETE FROM kv", [])?;
            Ok(())
        })
    }

    fn get_info(&self) -> BoxFuture<'_, Result<StorageInfo>> {
        Box::pin(async move {
            let used = Self::used(&self.conn())?;
            Ok(StorageInfo::new(StorageBackend::Sqlite, used, self.quota))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[tokio::test]
    async fn test_sqlite_read_write() {
        let storage = SqliteStorage::in_memory(1024).unwrap();
        storage.write("doc/a", b"one").await.unwrap();
        storage.write("doc/a", b"two").await.unwrap();
        assert_eq!(storage.read("doc/a").await.unwrap(), Some(b"two".to_vec()));
        assert!(storage.read("doc/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_list_prefix_with_wildcards() {
        let storage = SqliteStorage::in_memory(1024).unwrap();
        storage.write("doc/a_1", b"x").await.unwrap();
        storage.write("doc/ab", b"x").await.unwrap();
        storage.write("queue/pending", b"x").await.unwrap();

        assert_eq!(storage.list("doc/a_").await.unwrap(), vec!["doc/a_1"]);
        assert_eq!(storage.list("doc/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_quota() {
        let storage = SqliteStorage::in_memory(12).unwrap();
        storage.write("k", b"0123456789").await.unwrap();
        let err = storage.write("j", b"0123456789").await.unwrap_err();
        assert!(matches!(err, SyncError::QuotaExceeded { .. }));

        assert!(storage.delete("k").await.unwrap());
        assert_eq!(storage.get_info().await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_sqlite_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let storage = SqliteStorage::open(&path, 1024).unwrap();
            storage.write("device-id", b"dev").await.unwrap();
        }
        let storage = SqliteStorage::open(&path, 1024).unwrap();
        assert_eq!(
            storage.read("device-id").await.unwrap(),
            Some(b"dev".to_vec())
        );
    }
}
