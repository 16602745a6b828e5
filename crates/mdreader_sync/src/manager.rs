//! Document sync manager.
//!
//! Owns one [`DocumentHandle`] per open document id. Every handle gets local
//! persistence; a replication binding is added only while the environment
//! approves it and `enable_cloud_sync` is set.
//!
//! # Example
//!
//! ```ignore
//! use mdreader_sync::{DocumentSyncManager, SyncConfig};
//!
//! let manager = DocumentSyncManager::builder(SyncConfig::load()?).build();
//! manager.init().await?;
//!
//! let doc = manager.get_document("welcome").await?;
//! doc.insert_text(0, "# Welcome\n")?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::crdt::{
    BindingContext, DocumentStatus, LocalPersistence, ReplicationBinding, ReplicationConnector,
    ReplicationTarget, SyncedDocument,
};
use crate::environment::{Environment, EnvironmentDetector, EnvironmentProbe, StaticProbe};
use crate::error::{Result, SyncError};
use crate::storage::{StorageProvider, StorageProviderFactory};

// ============================================================================
// DocumentHandle
// ============================================================================

/// One open document: the CRDT, its local persistence and, while approved,
/// its replication binding.
pub struct DocumentHandle {
    id: String,
    storage_key: String,
    document: Arc<SyncedDocument>,
    persistence: LocalPersistence,
    binding: Mutex<Option<ReplicationBinding>>,
    status: Arc<watch::Sender<DocumentStatus>>,
    detector: Arc<EnvironmentDetector>,
}

impl DocumentHandle {
    /// Document id (also the replication room name).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespaced key the document is stored under.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// The underlying CRDT.
    pub fn document(&self) -> &Arc<SyncedDocument> {
        &self.document
    }

    // ==================== Editing ====================

    /// Full body text.
    pub fn content(&self) -> String {
        self.document.content()
    }

    /// Body length in UTF-16 code units.
    pub fn content_len(&self) -> u32 {
        self.document.content_len()
    }

    /// Insert `text` at `index` (UTF-16 code units).
    pub fn insert_text(&self, index: u32, text: &str) -> Result<()> {
        let update = self.document.insert_text(index, text)?;
        self.dispatch_local(update);
        Ok(())
    }

    /// Delete `length` units starting at `index`.
    pub fn delete_text(&self, index: u32, length: u32) -> Result<()> {
        let update = self.document.delete_text(index, length)?;
        self.dispatch_local(update);
        Ok(())
    }

    /// Replace the whole body. Returns whether anything changed.
    pub fn set_content(&self, content: &str) -> bool {
        match self.document.set_content(content) {
            Some(update) => {
                self.dispatch_local(update);
                true
            }
            None => false,
        }
    }

    /// Document title.
    pub fn title(&self) -> Option<String> {
        self.document.title()
    }

    /// Set the document title.
    pub fn set_title(&self, title: &str) {
        let update = self.document.set_title(title);
        self.dispatch_local(update);
    }

    /// Read a metadata property.
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.document.metadata(key)
    }

    /// Write a metadata property.
    pub fn set_metadata(&self, key: &str, value: &str) {
        let update = self.document.set_metadata(key, value);
        self.dispatch_local(update);
    }

    /// Persist the edit and, if replicating, forward it.
    ///
    /// A binding still open after the environment stopped approving is
    /// closed here rather than used.
    fn dispatch_local(&self, update: Vec<u8>) {
        self.persistence.notify();

        let mut binding = self.binding();
        let Some(active) = binding.as_ref() else {
            return;
        };
        if self.detector.should_use_cloud_sync() {
            active.send_local(update);
        } else if let Some(stale) = binding.take() {
            log::warn!(
                "[DocumentSync] {} had a binding while replication is disapproved, closing it",
                self.id
            );
            stale.close();
        }
    }

    // ==================== Status ====================

    /// Current connected/synced flags.
    pub fn status(&self) -> DocumentStatus {
        *self.status.borrow()
    }

    /// Watch connected/synced flag changes.
    pub fn watch_status(&self) -> watch::Receiver<DocumentStatus> {
        self.status.subscribe()
    }

    /// Whether a replication binding is attached and running.
    pub fn is_replicating(&self) -> bool {
        self.binding()
            .as_ref()
            .is_some_and(|binding| !binding.is_finished())
    }

    /// Target of the attached binding, if any.
    pub fn replication_target(&self) -> Option<ReplicationTarget> {
        self.binding()
            .as_ref()
            .map(|binding| binding.target().clone())
    }

    /// Wait until every edit made so far is durable.
    pub async fn flush(&self) -> Result<()> {
        self.persistence.flush().await
    }

    /// Close the replication binding, leaving local persistence attached.
    pub fn close_replication(&self) -> bool {
        match self.binding().take() {
            Some(binding) => {
                binding.close();
                true
            }
            None => false,
        }
    }

    /// Close replication and flush local persistence.
    pub async fn close(&self) -> Result<()> {
        self.close_replication();
        self.flush().await
    }

    fn binding(&self) -> MutexGuard<'_, Option<ReplicationBinding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("id", &self.id)
            .field("storage_key", &self.storage_key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// DocumentSyncManager
// ============================================================================

type HandleCell = Arc<OnceCell<Arc<DocumentHandle>>>;
type HandleMap = Arc<Mutex<HashMap<String, HandleCell>>>;

fn lock_handles(handles: &HandleMap) -> MutexGuard<'_, HashMap<String, HandleCell>> {
    handles.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`DocumentSyncManager`], for injecting collaborators.
pub struct DocumentSyncManagerBuilder {
    config: SyncConfig,
    storage: Option<Arc<dyn StorageProvider>>,
    detector: Option<Arc<EnvironmentDetector>>,
    connector: Option<Arc<dyn ReplicationConnector>>,
}

impl DocumentSyncManagerBuilder {
    /// Use `storage` instead of asking the factory.
    pub fn storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share an existing detector.
    pub fn detector(mut self, detector: Arc<EnvironmentDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Replace the network transport.
    pub fn connector(mut self, connector: Arc<dyn ReplicationConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the manager. Call [`DocumentSyncManager::init`] before use.
    pub fn build(self) -> DocumentSyncManager {
        let detector = self
            .detector
            .unwrap_or_else(|| Arc::new(EnvironmentDetector::new(default_probe(&self.config))));
        let connector = self.connector.or_else(default_connector);

        let storage = OnceLock::new();
        if let Some(injected) = self.storage {
            let _ = storage.set(injected);
        }

        DocumentSyncManager {
            config: self.config,
            storage,
            detector,
            connector,
            handles: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }
}

/// Probe matching `config`: a reachability check against the sync server
/// when one is configured, otherwise a fixed offline answer.
pub fn default_probe(config: &SyncConfig) -> Arc<dyn EnvironmentProbe> {
    #[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
    {
        if let Some(url) = &config.sync_server_url {
            return Arc::new(crate::environment::TcpReachabilityProbe::new(
                url,
                config.connect_timeout(),
                config.user_id.clone(),
            ));
        }
    }
    Arc::new(StaticProbe::new(
        crate::environment::NetworkStatus::Offline,
        config.user_id.clone(),
    ))
}

fn default_connector() -> Option<Arc<dyn ReplicationConnector>> {
    #[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
    {
        Some(Arc::new(crate::crdt::WebSocketConnector))
    }
    #[cfg(not(all(not(target_arch = "wasm32"), feature = "native-sync")))]
    {
        None
    }
}

/// Owns the open documents of a session.
pub struct DocumentSyncManager {
    config: SyncConfig,
    storage: OnceLock<Arc<dyn StorageProvider>>,
    detector: Arc<EnvironmentDetector>,
    connector: Option<Arc<dyn ReplicationConnector>>,
    handles: HandleMap,
    listener: Mutex<Option<JoinHandle<()>>>,
}

static INSTANCE: tokio::sync::Mutex<Option<Arc<DocumentSyncManager>>> =
    tokio::sync::Mutex::const_new(None);

impl DocumentSyncManager {
    /// Manager with default collaborators for `config`.
    pub fn new(config: SyncConfig) -> Self {
        Self::builder(config).build()
    }

    /// Builder for injecting storage, detector or transport.
    pub fn builder(config: SyncConfig) -> DocumentSyncManagerBuilder {
        DocumentSyncManagerBuilder {
            config,
            storage: None,
            detector: None,
            connector: None,
        }
    }

    /// Process-wide manager, created and initialized on first use.
    ///
    /// `config` is only used when no instance exists yet.
    pub async fn get_instance(config: SyncConfig) -> Result<Arc<Self>> {
        let mut instance = INSTANCE.lock().await;
        if let Some(existing) = instance.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let manager = Arc::new(Self::new(config));
        manager.init().await?;
        *instance = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Shut down and forget the process-wide manager.
    ///
    /// The next [`get_instance`](Self::get_instance) builds a fresh one.
    pub async fn reset_instance() {
        let previous = INSTANCE.lock().await.take();
        if let Some(manager) = previous {
            manager.shutdown().await;
        }
    }

    /// Open storage (unless injected), initialize the detector and start
    /// reacting to environment changes. Idempotent.
    pub async fn init(&self) -> Result<Environment> {
        let storage = match self.storage.get() {
            Some(storage) => Arc::clone(storage),
            None => {
                let created = StorageProviderFactory::create_and_init(&self.config).await?;
                Arc::clone(self.storage.get_or_init(|| created))
            }
        };

        let env = if self.detector.is_initialized() {
            self.detector.get_environment()
        } else {
            self.detector.init(storage.as_ref()).await?
        };

        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_none() {
            *listener = Some(self.spawn_listener());
        }
        Ok(env)
    }

    /// Close every binding as soon as the environment stops approving.
    /// Re-approval reopens bindings lazily on the next access.
    fn spawn_listener(&self) -> JoinHandle<()> {
        let mut changes = self.detector.subscribe();
        let handles = Arc::clone(&self.handles);
        let mut approved = self.detector.should_use_cloud_sync();

        tokio::spawn(async move {
            while let Some(env) = changes.recv().await {
                let now = env.should_use_cloud_sync();
                if approved && !now {
                    let open: Vec<Arc<DocumentHandle>> = lock_handles(&handles)
                        .values()
                        .filter_map(|cell| cell.get().cloned())
                        .collect();
                    let closed = open.iter().filter(|h| h.close_replication()).count();
                    log::info!(
                        "[DocumentSync] Replication disapproved ({:?}/{:?}), closed {} bindings",
                        env.network,
                        env.auth,
                        closed
                    );
                }
                approved = now;
            }
        })
    }

    /// The session's storage provider.
    pub fn storage(&self) -> Result<Arc<dyn StorageProvider>> {
        self.storage.get().cloned().ok_or(SyncError::NotInitialized)
    }

    /// The environment detector driving the replication policy.
    pub fn environment(&self) -> &Arc<EnvironmentDetector> {
        &self.detector
    }

    /// Configuration this manager was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Return the handle for `document_id`, creating it on first access.
    ///
    /// Creation attaches local persistence; a failure there is returned.
    /// Replication is attached whenever the policy and configuration allow
    /// and the handle has no running binding; its failures are never returned.
    pub async fn get_document(&self, document_id: &str) -> Result<Arc<DocumentHandle>> {
        let storage = self.storage()?;

        let cell = {
            let mut handles = lock_handles(&self.handles);
            Arc::clone(handles.entry(document_id.to_string()).or_default())
        };

        let handle = match cell
            .get_or_try_init(|| self.create_handle(document_id, storage))
            .await
        {
            Ok(handle) => Arc::clone(handle),
            Err(e) => {
                let mut handles = lock_handles(&self.handles);
                if handles
                    .get(document_id)
                    .is_some_and(|c| Arc::ptr_eq(c, &cell) && !c.initialized())
                {
                    handles.remove(document_id);
                }
                return Err(e);
            }
        };

        self.ensure_replication(&handle);
        Ok(handle)
    }

    async fn create_handle(
        &self,
        document_id: &str,
        storage: Arc<dyn StorageProvider>,
    ) -> Result<Arc<DocumentHandle>> {
        let storage_key = self.detector.get_storage_key(document_id);
        let (document, persistence) = LocalPersistence::attach(storage, &storage_key).await?;
        let (status, _) = watch::channel(DocumentStatus::default());

        log::debug!(
            "[DocumentSync] Opened {} (stored as {})",
            document_id,
            storage_key
        );
        Ok(Arc::new(DocumentHandle {
            id: document_id.to_string(),
            storage_key,
            document,
            persistence,
            binding: Mutex::new(None),
            status: Arc::new(status),
            detector: Arc::clone(&self.detector),
        }))
    }

    fn ensure_replication(&self, handle: &DocumentHandle) {
        if !self.config.enable_cloud_sync || !self.detector.should_use_cloud_sync() {
            return;
        }
        let Some(connector) = &self.connector else {
            log::debug!("[DocumentSync] No transport in this build, {} stays local", handle.id);
            return;
        };
        let Some(endpoint) = &self.config.sync_server_url else {
            log::debug!("[DocumentSync] No sync server configured, {} stays local", handle.id);
            return;
        };

        let mut slot = handle.binding();
        if slot.as_ref().is_some_and(|binding| !binding.is_finished()) {
            return;
        }

        let target = ReplicationTarget {
            endpoint: endpoint.clone(),
            room: handle.id.clone(),
            token: self.config.session_token.clone(),
        };
        let context = BindingContext {
            document: Arc::clone(&handle.document),
            persistence: handle.persistence.sink(),
            status: Arc::clone(&handle.status),
            connect_timeout: self.config.connect_timeout(),
        };
        match ReplicationBinding::open(&self.detector, Arc::clone(connector), target, context) {
            Ok(binding) => *slot = Some(binding),
            Err(e) => log::warn!("[DocumentSync] {} stays local: {}", handle.id, e),
        }
    }

    /// Ids of every open document, sorted.
    pub fn open_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_handles(&self.handles)
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close one document. Returns whether it was open.
    pub async fn close_document(&self, document_id: &str) -> Result<bool> {
        let cell = lock_handles(&self.handles).remove(document_id);
        match cell.and_then(|cell| cell.get().cloned()) {
            Some(handle) => {
                handle.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop reacting to the environment, close every document and flush it.
    pub async fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }

        let handles: Vec<Arc<DocumentHandle>> = lock_handles(&self.handles)
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();
        for handle in handles {
            if let Err(e) = handle.close().await {
                log::error!("[DocumentSync] Failed to flush {}: {}", handle.id, e);
            }
        }
        log::info!("[DocumentSync] Shut down");
    }
}
