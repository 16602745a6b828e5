//! Storage provider selection.

use std::sync::Arc;

use super::{MemoryStorage, StorageBackend, StorageProvider};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

#[cfg(not(target_arch = "wasm32"))]
use super::FileStorage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
use super::SqliteStorage;

/// File name of the SQLite database inside the data directory.
pub const SQLITE_FILE_NAME: &str = "mdreader-sync.db";

/// Sub-directory used by the file backend inside the data directory.
pub const FILE_STORE_DIR: &str = "store";

/// Chooses and initializes the session's storage provider.
///
/// Selection happens exactly once per session: the configured backend when
/// `storage_backend` is set, otherwise the most capable one available.
pub struct StorageProviderFactory;

impl StorageProviderFactory {
    /// Pick a backend for `config` and open it.
    ///
    /// An explicitly configured backend that fails to open is an error.
    /// A probed backend falls back to memory with a warning.
    pub async fn create_and_init(config: &SyncConfig) -> Result<Arc<dyn StorageProvider>> {
        if let Some(backend) = config.storage_backend {
            log::info!("[StorageFactory] Using configured backend: {}", backend);
            return Self::create(backend, config).await;
        }

        let backend = Self::detect_backend(config).await;
        match Self::create(backend, config).await {
            Ok(provider) => {
                log::info!("[StorageFactory] Selected backend: {}", backend);
                Ok(provider)
            }
            Err(e) => {
                log::warn!(
                    "[StorageFactory] {} backend failed to open ({}), falling back to memory",
                    backend,
                    e
                );
                Ok(Arc::new(MemoryStorage::with_quota(config.storage_quota_bytes)))
            }
        }
    }

    /// Open a specific backend.
    pub async fn create(
        backend: StorageBackend,
        config: &SyncConfig,
    ) -> Result<Arc<dyn StorageProvider>> {
        let quota = config.storage_quota_bytes;
        match backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStorage::with_quota(quota))),
            #[cfg(not(target_arch = "wasm32"))]
            StorageBackend::File => {
                let dir = config.resolved_data_dir().ok_or_else(|| {
                    SyncError::Durability("no data directory available".to_string())
                })?;
                Ok(Arc::new(
                    FileStorage::open(dir.join(FILE_STORE_DIR), quota).await?,
                ))
            }
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            StorageBackend::Sqlite => {
                let dir = config.resolved_data_dir().ok_or_else(|| {
                    SyncError::Durability("no data directory available".to_string())
                })?;
                tokio::fs::create_dir_all(&dir).await?;
                Ok(Arc::new(SqliteStorage::open(
                    dir.join(SQLITE_FILE_NAME),
                    quota,
                )?))
            }
            #[allow(unreachable_patterns)]
            other => Err(SyncError::Durability(format!(
                "{} storage is not available in this build",
                other
            ))),
        }
    }

    /// Probe which backend this environment supports best.
    pub async fn detect_backend(config: &SyncConfig) -> StorageBackend {
        let writable = match config.resolved_data_dir() {
            Some(dir) => Self::is_writable(&dir).await,
            None => false,
        };

        if !writable {
            log::warn!(
                "[StorageFactory] No writable data directory, local data will not survive a restart"
            );
            return StorageBackend::Memory;
        }

        if cfg!(all(not(target_arch = "wasm32"), feature = "sqlite")) {
            StorageBackend::Sqlite
        } else {
            StorageBackend::File
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    async fn is_writable(dir: &std::path::Path) -> bool {
        if tokio::fs::create_dir_all(dir).await.is_err() {
            return false;
        }
        let probe = dir.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                true
            }
            Err(_) => false,
        }
    }

    #[cfg(target_arch = "wasm32")]
    async fn is_writable(_dir: &std::path::Path) -> bool {
        false
    }
}
