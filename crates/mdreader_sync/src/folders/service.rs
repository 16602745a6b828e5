//! Optimistic folder writes.
//!
//! Every write lands in the [`FolderCache`] first, flagged
//! `pending_changes`. When connected and nothing is queued ahead of it, the
//! change goes straight to the remote; otherwise, or when that attempt fails
//! transiently, it is queued. A permanent rejection of a direct write undoes
//! the cache change and is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use super::cache::FolderCache;
use super::types::{CachedFolder, DEFAULT_FOLDER_ICON, FolderUpdate, NewFolder};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::queue::{
    ChangeOperation, ChangeRequest, EntityType, Enqueued, OfflineChangeQueue, Reconciliation,
    RemoteAck, RemoteAuthority, is_temp_id, temp_id,
};

/// How a write reached (or will reach) the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Accepted by the remote directly
    Synced,
    /// Left in the offline queue
    Queued(Enqueued),
}

/// Result of a folder write: the folder as now cached, and where the change went.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderWrite {
    /// Cached state after the write
    pub folder: CachedFolder,
    /// Direct or queued
    pub outcome: WriteOutcome,
}

/// Folder operations for the UI.
pub struct FolderSyncService {
    cache: Arc<FolderCache>,
    queue: OfflineChangeQueue,
    remote: Arc<dyn RemoteAuthority>,
    timeout: Duration,
}

impl FolderSyncService {
    /// Wire the service and register `cache` as the queue's folder mirror.
    pub fn new(
        cache: Arc<FolderCache>,
        queue: OfflineChangeQueue,
        remote: Arc<dyn RemoteAuthority>,
        config: &SyncConfig,
    ) -> Self {
        queue.register_mirror(Arc::clone(&cache) as Arc<dyn crate::queue::LocalMirror>);
        Self {
            cache,
            queue,
            remote,
            timeout: config.replay_timeout(),
        }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Arc<FolderCache> {
        &self.cache
    }

    // ==================== Reads ====================

    /// Children of `parent_id` (`None` for the root), ordered by position.
    pub async fn list_folders(
        &self,
        workspace_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<CachedFolder>> {
        self.cache.children(workspace_id, parent_id).await
    }

    /// Every folder of a workspace.
    pub async fn all_folders(&self, workspace_id: &str) -> Result<Vec<CachedFolder>> {
        self.cache.all(workspace_id).await
    }

    /// One folder.
    pub async fn get_folder(&self, workspace_id: &str, id: &str) -> Result<Option<CachedFolder>> {
        self.cache.get(workspace_id, id).await
    }

    async fn require(&self, workspace_id: &str, id: &str) -> Result<CachedFolder> {
        self.cache
            .get(workspace_id, id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("folder {}", id)))
    }

    // ==================== Writes ====================

    /// Create a folder under a temporary id.
    ///
    /// When the create goes through directly, the returned folder already
    /// carries the server id and a `folder-synced` event has been sent.
    pub async fn create_folder(&self, workspace_id: &str, new: NewFolder) -> Result<FolderWrite> {
        new.validate()?;
        if let Some(parent_id) = &new.parent_id {
            self.require(workspace_id, parent_id).await?;
        }

        let now = Utc::now();
        let folder = CachedFolder {
            id: temp_id(EntityType::Folder),
            workspace_id: workspace_id.to_string(),
            parent_id: new.parent_id.clone(),
            name: new.name.trim().to_string(),
            icon: Some(new.icon.clone().unwrap_or_else(|| DEFAULT_FOLDER_ICON.to_string())),
            color: new.color.clone(),
            position: new.position,
            created_at: now,
            updated_at: now,
            last_synced: None,
            pending_changes: true,
        };
        self.cache.upsert(folder.clone()).await?;

        let request = ChangeRequest::new(
            EntityType::Folder,
            &folder.id,
            workspace_id,
            ChangeOperation::Create,
            new.payload(),
        );
        match self.write_through(request).await {
            Ok(WriteResult::Direct(ack)) => {
                let synced = self.reconcile_direct(&folder, &ack).await?;
                Ok(FolderWrite {
                    folder: synced,
                    outcome: WriteOutcome::Synced,
                })
            }
            Ok(WriteResult::Queued(enqueued)) => Ok(FolderWrite {
                folder,
                outcome: WriteOutcome::Queued(enqueued),
            }),
            Err(e) => {
                self.cache.remove(workspace_id, &folder.id).await?;
                Err(e)
            }
        }
    }

    /// Change name, icon or color.
    pub async fn update_folder(
        &self,
        workspace_id: &str,
        id: &str,
        update: FolderUpdate,
    ) -> Result<FolderWrite> {
        update.validate()?;
        let previous = self.require(workspace_id, id).await?;
        if update.is_empty() {
            return Err(SyncError::InvalidOperation("nothing to update".to_string()));
        }

        let mut folder = previous.clone();
        update.apply_to(&mut folder);
        self.write_existing(previous, folder, update.payload()).await
    }

    /// Move a folder under `parent_id` (`None` for the root) at `position`.
    ///
    /// Moving a folder into itself or one of its descendants is refused.
    pub async fn move_folder(
        &self,
        workspace_id: &str,
        id: &str,
        parent_id: Option<&str>,
        position: i64,
    ) -> Result<FolderWrite> {
        if position < 0 {
            return Err(SyncError::InvalidOperation(
                "position must not be negative".to_string(),
            ));
        }
        let previous = self.require(workspace_id, id).await?;

        let mut ancestor = parent_id.map(str::to_string);
        while let Some(current) = ancestor {
            if current == id {
                return Err(SyncError::InvalidOperation(format!(
                    "moving {} under {} would create a cycle",
                    id,
                    parent_id.unwrap_or_default()
                )));
            }
            ancestor = self.require(workspace_id, &current).await?.parent_id;
        }

        let mut folder = previous.clone();
        folder.parent_id = parent_id.map(str::to_string);
        folder.position = position;
        let payload = json!({ "parent_id": parent_id, "position": position });
        self.write_existing(previous, folder, payload).await
    }

    /// Delete an empty folder.
    pub async fn delete_folder(&self, workspace_id: &str, id: &str) -> Result<WriteOutcome> {
        let previous = self.require(workspace_id, id).await?;
        if !self.cache.children(workspace_id, Some(id)).await?.is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "folder {} still has subfolders",
                id
            )));
        }

        self.cache.remove(workspace_id, id).await?;
        let request = ChangeRequest::new(
            EntityType::Folder,
            id,
            workspace_id,
            ChangeOperation::Delete,
            Value::Null,
        );
        match self.write_through(request).await {
            Ok(WriteResult::Direct(_)) => Ok(WriteOutcome::Synced),
            Ok(WriteResult::Queued(enqueued)) => Ok(WriteOutcome::Queued(enqueued)),
            Err(e) => {
                self.cache.upsert(previous).await?;
                Err(e)
            }
        }
    }

    async fn write_existing(
        &self,
        previous: CachedFolder,
        mut folder: CachedFolder,
        payload: Value,
    ) -> Result<FolderWrite> {
        folder.updated_at = Utc::now();
        folder.pending_changes = true;
        // The create may have been reconciled since `previous` was read
        let folder = self.cache.upsert(folder).await?;

        let request = ChangeRequest::new(
            EntityType::Folder,
            &folder.id,
            &folder.workspace_id,
            ChangeOperation::Update,
            payload,
        );
        match self.write_through(request).await {
            Ok(WriteResult::Direct(_)) => {
                self.cache.mark_synced(&folder.workspace_id, &folder.id).await?;
                let synced = self.require(&folder.workspace_id, &folder.id).await?;
                Ok(FolderWrite {
                    folder: synced,
                    outcome: WriteOutcome::Synced,
                })
            }
            Ok(WriteResult::Queued(enqueued)) => Ok(FolderWrite {
                folder,
                outcome: WriteOutcome::Queued(enqueued),
            }),
            Err(e) => {
                self.cache.upsert(previous).await?;
                Err(e)
            }
        }
    }

    /// Send directly when possible, otherwise queue. Only permanent
    /// rejections and durability failures come back as errors.
    async fn write_through(&self, mut request: ChangeRequest) -> Result<WriteResult> {
        self.queue.resolve_aliases(&mut request).await;
        let must_queue = (is_temp_id(&request.entity_id)
            && request.operation != ChangeOperation::Create)
            || self.queue.has_dependencies(&request).await;

        if self.queue.is_connected() && !must_queue {
            let attempt = tokio::time::timeout(self.timeout, self.remote.apply(&request)).await;
            match attempt {
                Ok(Ok(ack)) => return Ok(WriteResult::Direct(ack)),
                Ok(Err(e)) if !e.is_transient() => {
                    log::warn!(
                        "[FolderSync] {} {} rejected: {}",
                        request.operation,
                        request.entity_id,
                        e
                    );
                    return Err(e);
                }
                Ok(Err(e)) => log::warn!(
                    "[FolderSync] {} {} failed, queueing: {}",
                    request.operation,
                    request.entity_id,
                    e
                ),
                Err(_) => log::warn!(
                    "[FolderSync] {} {} timed out, queueing",
                    request.operation,
                    request.entity_id
                ),
            }
        }
        Ok(WriteResult::Queued(self.queue.queue_change(request).await?))
    }

    async fn reconcile_direct(
        &self,
        folder: &CachedFolder,
        ack: &RemoteAck,
    ) -> Result<CachedFolder> {
        let workspace_id = &folder.workspace_id;
        if ack.id != folder.id {
            self.cache
                .reconcile_id(workspace_id, &folder.id, &ack.id)
                .await?;
        }
        self.cache.mark_synced(workspace_id, &ack.id).await?;
        let synced = self.require(workspace_id, &ack.id).await?;

        if ack.id != folder.id {
            self.queue.publish_reconciled(Reconciliation {
                entity_type: EntityType::Folder,
                workspace_id: workspace_id.clone(),
                old_id: folder.id.clone(),
                new_id: ack.id.clone(),
                entity: Some(synced.to_value()),
            });
        }
        Ok(synced)
    }

    // ==================== Refresh ====================

    /// Replace the cached workspace with the remote's folders.
    ///
    /// Entries with pending changes win over the remote copy, and folders
    /// deleted locally but not yet remotely stay deleted. Offline, the cache
    /// is returned as it is.
    pub async fn refresh(&self, workspace_id: &str) -> Result<Vec<CachedFolder>> {
        if !self.queue.is_connected() {
            log::debug!("[FolderSync] Offline, serving cached folders for {}", workspace_id);
            return self.cache.all(workspace_id).await;
        }

        let items = tokio::time::timeout(self.timeout, self.remote.list(EntityType::Folder, workspace_id))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout.as_millis() as u64))??;

        let pending_deletes: Vec<String> = self
            .queue
            .pending()
            .await
            .into_iter()
            .filter(|c| {
                c.request.entity_type == EntityType::Folder
                    && c.request.operation == ChangeOperation::Delete
            })
            .map(|c| c.request.entity_id)
            .collect();

        let mut merged: Vec<CachedFolder> = self
            .cache
            .all(workspace_id)
            .await?
            .into_iter()
            .filter(|f| f.pending_changes)
            .collect();
        for item in items {
            let folder = CachedFolder::from_remote(item)?;
            if merged.iter().any(|f| f.id == folder.id) || pending_deletes.contains(&folder.id) {
                continue;
            }
            merged.push(folder);
        }

        log::info!(
            "[FolderSync] Refreshed {}: {} folders",
            workspace_id,
            merged.len()
        );
        self.cache.replace_all(workspace_id, merged).await?;
        self.cache.all(workspace_id).await
    }
}

enum WriteResult {
    Direct(RemoteAck),
    Queued(Enqueued),
}
