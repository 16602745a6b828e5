#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;

/// Configuration options
pub mod config;

/// CRDT documents, local persistence and network replication
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Environment detection and the replication policy decision
pub mod environment;

/// Folder cache and the optimistic folder write path
pub mod folders;

/// Document sync manager (one CRDT handle per open document)
pub mod manager;

/// Offline change queue for structural entities
pub mod queue;

/// Session wiring for applications
pub mod session;

/// Local durable storage providers and the provider factory
pub mod storage;

#[cfg(test)]
pub mod test_utils;

pub use config::SyncConfig;
pub use environment::{AuthState, Environment, EnvironmentDetector, NetworkStatus, Platform};
pub use error::{Result, SyncError};
pub use manager::{DocumentHandle, DocumentSyncManager};
pub use queue::{OfflineChangeQueue, PendingChange, QueueEvent};
pub use session::SyncSession;
pub use storage::{StorageProvider, StorageProviderFactory};

/// A boxed future for object-safe async methods.
///
/// On native targets, futures are `Send` for compatibility with multi-threaded runtimes.
#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed future for object-safe async methods.
///
/// WASM version without `Send` requirement - JavaScript is single-threaded.
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
