//! Local folder mirror.
//!
//! One table per workspace, stored under `folders/{workspace_id}` and kept
//! in memory once loaded. Each table carries a by-parent index and the
//! temporary ids it has re-keyed, so a write still holding a temporary id
//! lands on the reconciled entry instead of resurrecting the old one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::types::CachedFolder;
use crate::BoxFuture;
use crate::error::Result;
use crate::queue::{EntityType, LocalMirror};
use crate::storage::{StorageProvider, read_json, write_json};

/// Storage key prefix of folder tables.
pub const FOLDER_KEY_PREFIX: &str = "folders/";

#[derive(Debug, Clone, Default)]
struct FolderTable {
    folders: BTreeMap<String, CachedFolder>,
    by_parent: HashMap<Option<String>, BTreeSet<String>>,
    /// Temporary id to server id, for this process only
    aliases: HashMap<String, String>,
}

impl FolderTable {
    fn from_folders(folders: Vec<CachedFolder>) -> Self {
        let mut table = Self::default();
        for folder in folders {
            table.insert(folder);
        }
        table
    }

    fn insert(&mut self, folder: CachedFolder) {
        if let Some(previous) = self.folders.get(&folder.id) {
            let parent = previous.parent_id.clone();
            self.unindex(&parent, &folder.id);
        }
        self.by_parent
            .entry(folder.parent_id.clone())
            .or_default()
            .insert(folder.id.clone());
        self.folders.insert(folder.id.clone(), folder);
    }

    fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map_or(id, String::as_str)
    }

    /// Point `folder` and its parent at reconciled ids.
    fn resolved(&self, mut folder: CachedFolder) -> CachedFolder {
        folder.id = self.resolve(&folder.id).to_string();
        if let Some(parent) = folder.parent_id.take() {
            folder.parent_id = Some(self.resolve(&parent).to_string());
        }
        folder
    }

    fn remove(&mut self, id: &str) -> Option<CachedFolder> {
        let folder = self.folders.remove(id)?;
        self.unindex(&folder.parent_id, id);
        Some(folder)
    }

    fn unindex(&mut self, parent: &Option<String>, id: &str) {
        if let Some(children) = self.by_parent.get_mut(parent) {
            children.remove(id);
            if children.is_empty() {
                self.by_parent.remove(parent);
            }
        }
    }

    fn children(&self, parent: Option<&str>) -> Vec<CachedFolder> {
        let key = parent.map(str::to_string);
        let mut children: Vec<CachedFolder> = self
            .by_parent
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.folders.get(id).cloned())
            .collect();
        children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        children
    }

    fn to_vec(&self) -> Vec<CachedFolder> {
        self.folders.values().cloned().collect()
    }
}

/// Durable folder mirror for every workspace.
pub struct FolderCache {
    storage: Arc<dyn StorageProvider>,
    tables: Mutex<HashMap<String, FolderTable>>,
}

impl FolderCache {
    /// Cache over `storage`. Tables load on first use.
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn key(workspace_id: &str) -> String {
        format!("{}{}", FOLDER_KEY_PREFIX, workspace_id)
    }

    /// Run `f` on the loaded table of `workspace_id`.
    async fn with_table<T>(
        &self,
        workspace_id: &str,
        f: impl FnOnce(&FolderTable) -> T,
    ) -> Result<T> {
        let mut tables = self.tables.lock().await;
        let table = self.loaded(&mut tables, workspace_id).await?;
        Ok(f(table))
    }

    /// Run `f` on a copy of the table, persist the copy, then keep it.
    /// A failed write leaves the cache untouched.
    async fn modify<T>(
        &self,
        workspace_id: &str,
        f: impl FnOnce(&mut FolderTable) -> T,
    ) -> Result<T> {
        let mut tables = self.tables.lock().await;
        let mut table = self.loaded(&mut tables, workspace_id).await?.clone();
        let out = f(&mut table);
        write_json(self.storage.as_ref(), &Self::key(workspace_id), &table.to_vec()).await?;
        tables.insert(workspace_id.to_string(), table);
        Ok(out)
    }

    async fn loaded<'a>(
        &self,
        tables: &'a mut HashMap<String, FolderTable>,
        workspace_id: &str,
    ) -> Result<&'a mut FolderTable> {
        if !tables.contains_key(workspace_id) {
            let stored: Vec<CachedFolder> = read_json(self.storage.as_ref(), &Self::key(workspace_id))
                .await?
                .unwrap_or_default();
            log::debug!(
                "[FolderCache] Loaded {} folders for {}",
                stored.len(),
                workspace_id
            );
            tables.insert(workspace_id.to_string(), FolderTable::from_folders(stored));
        }
        Ok(tables.entry(workspace_id.to_string()).or_default())
    }

    /// One folder.
    pub async fn get(&self, workspace_id: &str, id: &str) -> Result<Option<CachedFolder>> {
        self.with_table(workspace_id, |t| t.folders.get(id).cloned())
            .await
    }

    /// Children of `parent_id` (`None` for the root), ordered by position.
    pub async fn children(
        &self,
        workspace_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<CachedFolder>> {
        self.with_table(workspace_id, |t| t.children(parent_id))
            .await
    }

    /// Every folder of a workspace.
    pub async fn all(&self, workspace_id: &str) -> Result<Vec<CachedFolder>> {
        self.with_table(workspace_id, FolderTable::to_vec).await
    }

    /// Insert or replace a folder. A reconciled temporary id (as id or
    /// parent) is replaced by its server id; the stored folder is returned.
    pub async fn upsert(&self, folder: CachedFolder) -> Result<CachedFolder> {
        let workspace_id = folder.workspace_id.clone();
        self.modify(&workspace_id, |t| {
            let folder = t.resolved(folder);
            t.insert(folder.clone());
            folder
        })
        .await
    }

    /// Remove a folder, returning it. Follows reconciled temporary ids.
    pub async fn remove(&self, workspace_id: &str, id: &str) -> Result<Option<CachedFolder>> {
        self.modify(workspace_id, |t| {
            let id = t.resolve(id).to_string();
            t.remove(&id)
        })
        .await
    }

    /// Replace a workspace's table wholesale.
    pub async fn replace_all(&self, workspace_id: &str, folders: Vec<CachedFolder>) -> Result<()> {
        self.modify(workspace_id, |t| {
            let aliases = std::mem::take(&mut t.aliases);
            *t = FolderTable::from_folders(folders);
            t.aliases = aliases;
        })
        .await
    }

    /// Re-key `old_id` as `new_id` and repoint its children.
    pub async fn reconcile_id(
        &self,
        workspace_id: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<Option<CachedFolder>> {
        self.modify(workspace_id, |t| {
            let children: Vec<String> = t
                .by_parent
                .get(&Some(old_id.to_string()))
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
            for child_id in children {
                if let Some(mut child) = t.folders.get(&child_id).cloned() {
                    child.parent_id = Some(new_id.to_string());
                    t.insert(child);
                }
            }

            t.aliases.insert(old_id.to_string(), new_id.to_string());
            let mut folder = t.remove(old_id)?;
            folder.id = new_id.to_string();
            t.insert(folder.clone());
            Some(folder)
        })
        .await
    }

    /// Clear `pending_changes` and stamp `last_synced`.
    pub async fn mark_synced(&self, workspace_id: &str, id: &str) -> Result<bool> {
        self.modify(workspace_id, |t| match t.folders.get(id).cloned() {
            Some(mut folder) => {
                folder.pending_changes = false;
                folder.last_synced = Some(Utc::now());
                t.insert(folder);
                true
            }
            None => false,
        })
        .await
    }
}

impl LocalMirror for FolderCache {
    fn entity_type(&self) -> EntityType {
        EntityType::Folder
    }

    fn reconcile<'a>(
        &'a self,
        workspace_id: &'a str,
        old_id: &'a str,
        new_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            let folder = self.reconcile_id(workspace_id, old_id, new_id).await?;
            Ok(folder.map(|f| f.to_value()))
        })
    }

    fn mark_synced<'a>(
        &'a self,
        workspace_id: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            FolderCache::mark_synced(self, workspace_id, entity_id).await?;
            Ok(())
        })
    }

    fn discard<'a>(
        &'a self,
        workspace_id: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.remove(workspace_id, entity_id).await?.is_some() {
                log::info!(
                    "[FolderCache] Dropped {}, its create was given up on",
                    entity_id
                );
            }
            Ok(())
        })
    }
}
