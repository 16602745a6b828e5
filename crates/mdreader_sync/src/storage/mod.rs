//! Local durable storage.
//!
//! Every piece of client state (document snapshots, the pending-change queue,
//! the folder mirror and the device id) lives behind one [`StorageProvider`]
//! chosen once per session by the [`StorageProviderFactory`].
//!
//! Keys are flat strings using `/` as a namespace separator:
//!
//! | key | contents |
//! |---|---|
//! | `doc/{storage_key}` | CRDT snapshot of one document |
//! | `queue/state` | offline change queue: pending records, dead letters, id aliases |
//! | `folders/{workspace_id}` | folder mirror table |
//! | `device-id` | installation-wide device identifier |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BoxFuture;
use crate::error::{Result, SyncError};

mod factory;
#[cfg(not(target_arch = "wasm32"))]
mod file;
mod memory;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite;

pub use factory::StorageProviderFactory;
#[cfg(not(target_arch = "wasm32"))]
pub use file::FileStorage;
pub use memory::MemoryStorage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite::SqliteStorage;

/// The closed set of storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile in-process map
    Memory,
    /// One file per key under the data directory
    File,
    /// Key/value table in a single SQLite database
    Sqlite,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::File => write!(f, "file"),
            StorageBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Usage report of a storage provider, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    /// Backend serving the session
    pub backend: StorageBackend,
    /// Bytes currently stored
    pub used: u64,
    /// Bytes still writable before the quota is hit
    pub available: u64,
    /// Configured quota
    pub total: u64,
}

impl StorageInfo {
    pub(crate) fn new(backend: StorageBackend, used: u64, total: u64) -> Self {
        Self {
            backend,
            used,
            available: total.saturating_sub(used),
            total,
        }
    }
}

/// Async key/value interface over client-side durable storage.
///
/// A successful `write` means the value survives a restart of the process
/// (except for [`MemoryStorage`]). Writes that would push the store over its
/// quota fail with [`SyncError::QuotaExceeded`].
pub trait StorageProvider: Send + Sync {
    /// Which backend this provider is.
    fn backend(&self) -> StorageBackend;

    /// Read the value stored under `key`.
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn write<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Remove `key`. Returns whether it existed.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// List every key starting with `prefix`, sorted.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Check whether `key` holds a value.
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.read(key).await?.is_some()) })
    }

    /// Remove every key.
    fn clear(&self) -> BoxFuture<'_, Result<()>>;

    /// Report usage against the quota.
    fn get_info(&self) -> BoxFuture<'_, Result<StorageInfo>>;
}

/// Read and deserialize a JSON value.
pub async fn read_json<T: DeserializeOwned>(
    storage: &dyn StorageProvider,
    key: &str,
) -> Result<Option<T>> {
    match storage.read(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
pub async fn write_json<T: Serialize + ?Sized>(
    storage: &dyn StorageProvider,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    storage.write(key, &bytes).await
}

/// Size a key/value pair is charged against the quota.
pub(crate) fn entry_size(key: &str, value_len: usize) -> u64 {
    (key.len() + value_len) as u64
}

/// Check that replacing an entry of `old` bytes with one of `new` bytes fits.
pub(crate) fn check_quota(used: u64, old: u64, new: u64, quota: u64) -> Result<()> {
    let base = used.saturating_sub(old);
    if base + new > quota {
        return Err(SyncError::QuotaExceeded {
            requested: new,
            available: quota.saturating_sub(base),
        });
    }
    Ok(())
}
