//! In-memory storage implementation.
//!
//! Used by tests and as the last-resort fallback when no durable backend is
//! available. Data is lost when dropped.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use super::{StorageBackend, StorageInfo, StorageProvider, check_quota, entry_size};
use crate::BoxFuture;
use crate::config::DEFAULT_STORAGE_QUOTA_BYTES;
use crate::error::Result;

/// Volatile storage provider backed by a `BTreeMap`.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    quota: u64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::with_quota(DEFAULT_STORAGE_QUOTA_BYTES)
    }
}

impl MemoryStorage {
    /// Create a new empty in-memory storage with the default quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty in-memory storage limited to `quota` bytes.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            quota,
        }
    }

    fn used(entries: &BTreeMap<String, Vec<u8>>) -> u64 {
        entries.iter().map(|(k, v)| entry_size(k, v.len())).sum()
    }
}

impl StorageProvider for MemoryStorage {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            Ok(entries.get(key).cloned())
        })
    }

    fn write<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let old = entries
                .get(key)
                .map(|v| entry_size(key, v.len()))
                .unwrap_or(0);
            check_quota(
                Self::used(&entries),
                old,
                entry_size(key, value.len()),
                self.quota,
            )?;
            entries.insert(key.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            Ok(entries.remove(key).is_some())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            Ok(entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect())
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            Ok(())
        })
    }

    fn get_info(&self) -> BoxFuture<'_, Result<StorageInfo>> {
        Box::pin(async move {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            Ok(StorageInfo::new(
                StorageBackend::Memory,
                Self::used(&entries),
                self.quota,
            ))
        })
    }
}
