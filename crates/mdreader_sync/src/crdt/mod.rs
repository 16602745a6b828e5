//! CRDT documents and their two bindings.
//!
//! - [`SyncedDocument`]: the yrs document (`content` text + `metadata` map)
//! - [`LocalPersistence`]: always attached, writes snapshots to the local store
//! - [`ReplicationBinding`]: optional, exchanges y-sync messages with the
//!   sync server over a [`ReplicationConnector`]
//! - [`protocol`]: the Hocuspocus-compatible wire format

mod document;
mod persistence;
pub mod protocol;
mod replication;

pub use document::{CONTENT_TEXT_NAME, METADATA_MAP_NAME, SyncedDocument, TITLE_KEY};
pub use persistence::{DOC_KEY_PREFIX, LocalPersistence, PersistenceSink};
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use replication::WebSocketConnector;
pub use replication::{
    BindingContext, DocumentStatus, ReplicationBinding, ReplicationChannel, ReplicationConnector,
    ReplicationTarget,
};
