//! One object that owns a fully wired sync engine.
//!
//! [`SyncSession::start`] brings up storage and the environment detector
//! through the document manager, then opens the change queue and the folder
//! service over the same storage. Applications hold one session per process
//! (or per tab).

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::environment::{Environment, EnvironmentDetector};
use crate::error::Result;
use crate::folders::{FolderCache, FolderSyncService};
use crate::manager::DocumentSyncManager;
use crate::queue::{OfflineChangeQueue, RemoteAuthority, UnconfiguredRemote};

/// A running sync engine.
pub struct SyncSession {
    documents: Arc<DocumentSyncManager>,
    queue: OfflineChangeQueue,
    folders: FolderSyncService,
}

/// The REST remote for `config`: HTTP when an API address is configured,
/// otherwise a stand-in that keeps every change queued.
pub fn default_remote(config: &SyncConfig) -> Arc<dyn RemoteAuthority> {
    #[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
    {
        if let Some(base_url) = &config.api_base_url {
            return Arc::new(crate::queue::HttpRemoteAuthority::new(
                base_url.clone(),
                config.session_token.clone(),
                config.replay_timeout(),
            ));
        }
    }
    let _ = config;
    Arc::new(UnconfiguredRemote)
}

impl SyncSession {
    /// Start a session with the default collaborators for `config`.
    pub async fn start(config: SyncConfig) -> Result<Self> {
        let remote = default_remote(&config);
        Self::start_with(DocumentSyncManager::new(config), remote).await
    }

    /// Start a session around a prebuilt manager and remote.
    pub async fn start_with(
        documents: DocumentSyncManager,
        remote: Arc<dyn RemoteAuthority>,
    ) -> Result<Self> {
        let env = documents.init().await?;
        let storage = documents.storage()?;
        let config = documents.config().clone();

        let queue = OfflineChangeQueue::open(
            Arc::clone(&storage),
            Arc::clone(documents.environment()),
            Arc::clone(&remote),
            &config,
        )
        .await?;
        let folders = FolderSyncService::new(
            Arc::new(FolderCache::new(storage)),
            queue.clone(),
            remote,
            &config,
        );
        queue.start();

        log::info!(
            "[SyncSession] Started ({:?}/{:?}, cloud sync {})",
            env.network,
            env.auth,
            if env.should_use_cloud_sync() { "on" } else { "off" }
        );
        Ok(Self {
            documents: Arc::new(documents),
            queue,
            folders,
        })
    }

    /// Document handles.
    pub fn documents(&self) -> &Arc<DocumentSyncManager> {
        &self.documents
    }

    /// Folder reads and optimistic writes.
    pub fn folders(&self) -> &FolderSyncService {
        &self.folders
    }

    /// The structural change queue.
    pub fn queue(&self) -> &OfflineChangeQueue {
        &self.queue
    }

    /// The environment detector shared by every component.
    pub fn environment(&self) -> &Arc<EnvironmentDetector> {
        self.documents.environment()
    }

    /// Current environment snapshot.
    pub fn current_environment(&self) -> Environment {
        self.environment().get_environment()
    }

    /// Stop replaying queued changes, flush and close every document.
    pub async fn shutdown(&self) {
        self.queue.stop();
        self.documents.shutdown().await;
        log::info!("[SyncSession] Shut down");
    }
}
