//! Folder mirror and the optimistic folder write path.
//!
//! Folders are the representative structural entity: the UI reads them from
//! a local [`FolderCache`] and writes them through [`FolderSyncService`],
//! which keeps the cache consistent immediately and lets the offline change
//! queue carry the change to the remote when it can.

mod cache;
mod service;
mod types;

pub use cache::{FOLDER_KEY_PREFIX, FolderCache};
pub use service::{FolderSyncService, FolderWrite, WriteOutcome};
pub use types::{CachedFolder, DEFAULT_FOLDER_ICON, FolderUpdate, NewFolder};
