use serde::Serialize;
use thiserror::Error;

/// Unified error type for sync engine operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Durability errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local storage unavailable: {0}")]
    Durability(String),

    #[error("Storage quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // Encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CRDT error: {0}")]
    Crdt(String),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    // Remote errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Rejected by remote ({status}): {message}")]
    Rejected { status: u16, message: String },

    // Programming errors
    #[error("Replication refused: {0}")]
    PolicyViolation(String),

    #[error("Sync engine not initialized. Call init() first.")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Whether a retry may succeed without any change on our side.
    ///
    /// Network failures, timeouts and 5xx / 408 / 429 responses are transient.
    /// Every other rejection is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) => true,
            SyncError::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Whether this error means local data could not be made durable.
    pub fn is_durability(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_) | SyncError::Durability(_) | SyncError::QuotaExceeded { .. }
        ) || self.is_sqlite()
    }

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    fn is_sqlite(&self) -> bool {
        matches!(self, SyncError::Sqlite(_))
    }

    #[cfg(not(all(not(target_arch = "wasm32"), feature = "sqlite")))]
    fn is_sqlite(&self) -> bool {
        false
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of SyncError for IPC (e.g., Tauri)
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Whether retrying later may succeed
    pub transient: bool,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::Io(_) => "Io",
            SyncError::Durability(_) => "Durability",
            SyncError::QuotaExceeded { .. } => "QuotaExceeded",
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            SyncError::Sqlite(_) => "Sqlite",
            SyncError::Json(_) => "Json",
            SyncError::Crdt(_) => "Crdt",
            SyncError::ConfigParse(_) => "ConfigParse",
            SyncError::ConfigSerialize(_) => "ConfigSerialize",
            SyncError::NoConfigDir => "NoConfigDir",
            SyncError::Network(_) => "Network",
            SyncError::Timeout(_) => "Timeout",
            SyncError::Rejected { .. } => "Rejected",
            SyncError::PolicyViolation(_) => "PolicyViolation",
            SyncError::NotInitialized => "NotInitialized",
            SyncError::NotFound(_) => "NotFound",
            SyncError::InvalidOperation(_) => "InvalidOperation",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}
