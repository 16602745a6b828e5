//! Configuration for the sync engine.
//!
//! [`SyncConfig`] carries the replication endpoint, the REST base address,
//! the session token and the local storage settings. It is persisted as TOML
//! (typically at `~/.config/mdreader/sync.toml` on Unix systems).
//!
//! # Example
//!
//! ```ignore
//! use mdreader_sync::SyncConfig;
//!
//! let mut config = SyncConfig::load()?;
//! config.enable_cloud_sync = false;
//! config.save()?;
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::storage::StorageBackend;

/// Default local storage quota (256 MiB).
pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 256 * 1024 * 1024;

fn default_true() -> bool {
    true
}

fn default_quota() -> u64 {
    DEFAULT_STORAGE_QUOTA_BYTES
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_replay_timeout_ms() -> u64 {
    10_000
}

fn default_max_replay_attempts() -> u32 {
    5
}

/// User-configurable settings of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Replication endpoint (e.g., "wss://sync.mdreader.app/collab")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_server_url: Option<String>,

    /// Base address of the REST API (e.g., "https://api.mdreader.app")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// Session token for the replication handshake and REST calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    /// Identifier of the signed-in user, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Master switch for cloud replication. Narrows the environment policy,
    /// never widens it.
    #[serde(default = "default_true")]
    pub enable_cloud_sync: bool,

    /// Directory for local durable storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Force a storage backend instead of probing for one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_backend: Option<StorageBackend>,

    /// Maximum bytes the local store may hold
    #[serde(default = "default_quota")]
    pub storage_quota_bytes: u64,

    /// Upper bound on a replication connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on replaying one queued change
    #[serde(default = "default_replay_timeout_ms")]
    pub replay_timeout_ms: u64,

    /// Transient failures tolerated before a queued change is dead-lettered
    #[serde(default = "default_max_replay_attempts")]
    pub max_replay_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_server_url: None,
            api_base_url: None,
            session_token: None,
            user_id: None,
            enable_cloud_sync: true,
            data_dir: None,
            storage_backend: None,
            storage_quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            connect_timeout_ms: default_connect_timeout_ms(),
            replay_timeout_ms: default_replay_timeout_ms(),
            max_replay_attempts: default_max_replay_attempts(),
        }
    }
}

impl SyncConfig {
    /// Config for a purely local session with the given storage backend.
    pub fn local(backend: StorageBackend) -> Self {
        Self {
            enable_cloud_sync: false,
            storage_backend: Some(backend),
            ..Self::default()
        }
    }

    /// Parse a config from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Serialize this config to TOML text.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Replication connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-record replay timeout as a [`Duration`].
    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }
}

// ============================================================================
// Native-only implementation (not available in WASM)
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
impl SyncConfig {
    /// Get the config file path (~/.config/mdreader/sync.toml)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mdreader").join("sync.toml"))
    }

    /// Load config from default location, or return default if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::config_path()
            && path.exists()
        {
            return Self::load_from(&path);
        }

        Ok(SyncConfig::default())
    }

    /// Load config from a specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or(SyncError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Directory used for local durable storage.
    ///
    /// Falls back to the platform data directory (`~/.local/share/mdreader`).
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("mdreader")))
    }
}

#[cfg(target_arch = "wasm32")]
impl SyncConfig {
    /// Directory used for local durable storage. Only set explicitly on WASM.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone()
    }
}
