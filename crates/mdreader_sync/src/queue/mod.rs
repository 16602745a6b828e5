//! Offline change queue for structural entities.
//!
//! Folders, document metadata and workspace metadata are not CRDTs: they
//! replicate through explicit change records replayed against the REST
//! remote, with last-writer-wins semantics on the server.
//!
//! Ordering rules, from strongest to weakest:
//! 1. records of one entity replay in enqueue order
//! 2. a record referencing a temporary id waits for that id's create
//! 3. priority tier, then sequence number
//!
//! A create acknowledged with a server id triggers reconciliation: queued
//! records, registered [`LocalMirror`]s and subscribers all move to the new id.

mod offline;
mod remote;
mod store;
mod types;

pub use offline::{FlushReport, LocalMirror, OfflineChangeQueue, QueueSubscription};
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use remote::HttpRemoteAuthority;
pub use remote::{RemoteAck, RemoteAuthority, UnconfiguredRemote};
pub use store::QUEUE_KEY;
pub use types::{
    ChangeOperation, ChangeRequest, DeadLetter, EntityType, Enqueued, PendingChange, Priority,
    QueueEvent, Reconciliation, TEMP_ID_PREFIX, is_temp_id, temp_id,
};
