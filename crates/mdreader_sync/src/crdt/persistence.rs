//! Local persistence binding.
//!
//! Each open document has exactly one writer task. Mutations only mark the
//! document dirty; the writer coalesces pending marks and stores one full
//! snapshot under `doc/{storage_key}`. Snapshots are written in the order
//! the marks arrive, so the stored state never goes backwards.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::document::SyncedDocument;
use crate::error::{Result, SyncError};
use crate::storage::StorageProvider;

/// Storage key prefix for document snapshots.
pub const DOC_KEY_PREFIX: &str = "doc/";

enum PersistCommand {
    Dirty,
    Flush(oneshot::Sender<Result<()>>),
}

/// Cheap handle for marking a document dirty from other tasks.
#[derive(Clone)]
pub struct PersistenceSink {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistenceSink {
    /// Schedule a snapshot write.
    pub fn notify(&self) {
        // The writer only stops once every sink is gone
        let _ = self.tx.send(PersistCommand::Dirty);
    }
}

/// The always-present durable binding of a document.
pub struct LocalPersistence {
    key: String,
    sink: PersistenceSink,
    last_error: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl LocalPersistence {
    /// Load the document stored under `storage_key` (or start an empty one)
    /// and start its writer.
    ///
    /// The initial snapshot is written before returning, so a store that
    /// cannot accept writes fails here instead of on the first edit.
    pub async fn attach(
        storage: Arc<dyn StorageProvider>,
        storage_key: &str,
    ) -> Result<(Arc<SyncedDocument>, Self)> {
        let key = format!("{}{}", DOC_KEY_PREFIX, storage_key);

        let stored = storage
            .read(&key)
            .await
            .map_err(|e| durability(&key, e))?;
        let document = match stored {
            Some(snapshot) => {
                log::debug!(
                    "[Persistence] Loaded {} ({} bytes)",
                    key,
                    snapshot.len()
                );
                SyncedDocument::from_snapshot(&snapshot)?
            }
            None => SyncedDocument::new(),
        };
        let document = Arc::new(document);

        storage
            .write(&key, &document.encode_state())
            .await
            .map_err(|e| durability(&key, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let last_error = Arc::new(Mutex::new(None));
        let task = tokio::spawn(writer(
            key.clone(),
            storage,
            Arc::clone(&document),
            rx,
            Arc::clone(&last_error),
        ));

        Ok((
            document,
            Self {
                key,
                sink: PersistenceSink { tx },
                last_error,
                task,
            },
        ))
    }

    /// Storage key the snapshot lives under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A sink for marking the document dirty.
    pub fn sink(&self) -> PersistenceSink {
        self.sink.clone()
    }

    /// Schedule a snapshot write.
    pub fn notify(&self) {
        self.sink.notify();
    }

    /// Error of the most recent failed write, if it has not been retried successfully.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until every mark sent so far is durable.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sink
            .tx
            .send(PersistCommand::Flush(tx))
            .map_err(|_| SyncError::Durability(format!("writer for {} stopped", self.key)))?;
        rx.await
            .map_err(|_| SyncError::Durability(format!("writer for {} stopped", self.key)))?
    }
}

impl Drop for LocalPersistence {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            log::debug!("[Persistence] Releasing writer for {}", self.key);
        }
    }
}

async fn writer(
    key: String,
    storage: Arc<dyn StorageProvider>,
    document: Arc<SyncedDocument>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let mut dirty = false;

    while let Some(command) = rx.recv().await {
        let mut waiters = Vec::new();
        match command {
            PersistCommand::Dirty => dirty = true,
            PersistCommand::Flush(reply) => waiters.push(reply),
        }
        // Coalesce everything already queued into a single write
        while let Ok(command) = rx.try_recv() {
            match command {
                PersistCommand::Dirty => dirty = true,
                PersistCommand::Flush(reply) => waiters.push(reply),
            }
        }

        let outcome = if dirty {
            let snapshot = document.encode_state();
            match storage.write(&key, &snapshot).await {
                Ok(()) => {
                    dirty = false;
                    *last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    Ok(())
                }
                Err(e) => {
                    // Stays dirty; the next mark or flush retries
                    log::error!("[Persistence] Failed to write {}: {}", key, e);
                    *last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(e.to_string());
                    Err(e.to_string())
                }
            }
        } else {
            Ok(())
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone().map_err(SyncError::Durability));
        }
    }

    if dirty {
        // Last chance after every handle is gone
        if let Err(e) = storage.write(&key, &document.encode_state()).await {
            log::error!("[Persistence] Final write of {} failed: {}", key, e);
        }
    }
}

fn durability(key: &str, e: SyncError) -> SyncError {
    if e.is_durability() {
        e
    } else {
        SyncError::Durability(format!("{}: {}", key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_attach_creates_snapshot() {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
        let (_doc, persistence) = LocalPersistence::attach(storage.clone(), "k")
            .await
            .unwrap();
        assert_eq!(persistence.key(), "doc/k");
        assert!(storage.exists("doc/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_edits_survive_reload() {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
        {
            let (doc, persistence) = LocalPersistence::attach(storage.clone(), "k")
                .await
                .unwrap();
            doc.insert_text(0, "offline edit").unwrap();
            persistence.notify();
            persistence.flush().await.unwrap();
        }

        let (doc, _persistence) = LocalPersistence::attach(storage, "k").await.unwrap();
        assert_eq!(doc.content(), "offline edit");
    }

    #[tokio::test]
    async fn test_unwritable_store_fails_attach() {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::with_quota(3));
        let err = match LocalPersistence::attach(storage, "k").await {
            Ok(_) => panic!("attach should fail"),
            Err(e) => e,
        };
        assert!(err.is_durability());
    }

    #[tokio::test]
    async fn test_flush_reports_write_failure() {
        // Room for the empty snapshot but not much more
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::with_quota(24));
        let (doc, persistence) = LocalPersistence::attach(storage, "k").await.unwrap();

        doc.insert_text(0, &"x".repeat(64)).unwrap();
        persistence.notify();
        let err = persistence.flush().await.unwrap_err();
        assert!(matches!(err, SyncError::Durability(_)));
        assert!(persistence.last_error().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_fatal() {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
        storage.write("doc/k", &[0xFF, 0xFF, 0xFF]).await.unwrap();
        assert!(LocalPersistence::attach(storage, "k").await.is_err());
    }
}
