//! Test utilities for mdreader_sync
//!
//! In-process stand-ins for the network: a y-sync relay and a recording
//! connector for replication, and a scripted REST remote for the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::BoxFuture;
use crate::crdt::protocol::{AuthMessage, Frame, Payload, SyncMessage};
use crate::crdt::{
    DocumentStatus, ReplicationChannel, ReplicationConnector, ReplicationTarget, SyncedDocument,
};
use crate::error::{Result, SyncError};
use crate::queue::{
    ChangeOperation, ChangeRequest, EntityType, QueueEvent, QueueSubscription, RemoteAck,
    RemoteAuthority, is_temp_id,
};
use crate::storage::{MemoryStorage, StorageBackend, StorageInfo, StorageProvider};

const WAIT: Duration = Duration::from_secs(5);

/// Wait until the status satisfies `pred`, failing the test after a few seconds.
pub async fn wait_for(
    status: &mut watch::Receiver<DocumentStatus>,
    pred: impl FnMut(&DocumentStatus) -> bool,
) {
    tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .expect("status never matched")
        .map(|_| ())
        .expect("status sender dropped");
}

/// Next queue event, failing the test after a few seconds.
pub async fn next_event(events: &mut QueueSubscription) -> QueueEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no queue event")
        .expect("queue dropped")
}

// ============================================================================
// RecordingConnector
// ============================================================================

#[derive(Default)]
struct RecordingState {
    targets: Vec<ReplicationTarget>,
    // Peer ends, kept so connections stay open
    peers: Vec<(mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedSender<Vec<u8>>)>,
}

/// Connector that records every target and never answers sync traffic.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    state: Arc<Mutex<RecordingState>>,
    refuse: bool,
}

impl RecordingConnector {
    /// Accepts every connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every connection with a network error.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Targets connected to so far.
    pub fn targets(&self) -> Vec<ReplicationTarget> {
        self.state.lock().unwrap().targets.clone()
    }

    /// Wait until at least `count` connections were attempted.
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.targets().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connections never attempted");
    }
}

impl ReplicationConnector for RecordingConnector {
    fn connect<'a>(
        &'a self,
        target: &'a ReplicationTarget,
    ) -> BoxFuture<'a, Result<ReplicationChannel>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.targets.push(target.clone());
            if self.refuse {
                return Err(SyncError::Network("connection refused".to_string()));
            }

            let (outgoing, from_binding) = mpsc::unbounded_channel();
            let (to_binding, incoming) = mpsc::unbounded_channel();
            if target.token.is_some() {
                let ok = Frame::auth(&target.room, AuthMessage::Authenticated("write".into()));
                let _ = to_binding.send(ok.encode());
            }
            state.peers.push((from_binding, to_binding));
            Ok(ReplicationChannel { outgoing, incoming })
        })
    }
}

// ============================================================================
// MemoryRelay
// ============================================================================

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Arc<SyncedDocument>>,
    denied: HashSet<String>,
    peers: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>,
}

/// An in-memory sync server: one document per room, updates fanned out
/// to every other connection in the room.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    fn room(&self, name: &str) -> Arc<SyncedDocument> {
        let mut state = self.state.lock().unwrap();
        Arc::clone(state.rooms.entry(name.to_string()).or_default())
    }

    /// Edit the server copy of `room` before anyone connects.
    pub fn seed(&self, room: &str, f: impl FnOnce(&SyncedDocument)) {
        f(&self.room(room));
    }

    /// Answer `token` with permission denied.
    pub fn deny_token(&self, token: &str) {
        self.state.lock().unwrap().denied.insert(token.to_string());
    }

    /// Wait until the server copy of `room` satisfies `pred`.
    pub async fn wait_until(&self, room: &str, pred: impl Fn(&SyncedDocument) -> bool) {
        let doc = self.room(room);
        tokio::time::timeout(WAIT, async {
            while !pred(&doc) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay document never matched");
    }

    fn broadcast(&self, room: &str, from: &mpsc::UnboundedSender<Vec<u8>>, update: Vec<u8>) {
        let frame = Frame::sync(room, SyncMessage::Update(update)).encode();
        let mut state = self.state.lock().unwrap();
        state.peers.retain(|(peer_room, peer)| {
            if peer_room != room || peer.same_channel(from) {
                return !peer.is_closed();
            }
            peer.send(frame.clone()).is_ok()
        });
    }

    fn handle(&self, bytes: &[u8], reply: &mpsc::UnboundedSender<Vec<u8>>) {
        let Ok(frame) = Frame::decode(bytes) else {
            return;
        };
        let room = frame.room.clone();
        let doc = self.room(&room);

        match frame.payload {
            Payload::Auth(AuthMessage::Token(token)) => {
                let answer = if self.state.lock().unwrap().denied.contains(&token) {
                    AuthMessage::PermissionDenied("invalid token".into())
                } else {
                    AuthMessage::Authenticated("write".into())
                };
                let _ = reply.send(Frame::auth(&room, answer).encode());
            }
            Payload::Sync(messages) => {
                for message in messages {
                    match message {
                        SyncMessage::SyncStep1(sv) => {
                            if let Ok(diff) = doc.encode_diff(&sv) {
                                let step2 = Frame::sync(&room, SyncMessage::SyncStep2(diff));
                                let _ = reply.send(step2.encode());
                            }
                            let step1 =
                                Frame::sync(&room, SyncMessage::SyncStep1(doc.encode_state_vector()));
                            let _ = reply.send(step1.encode());
                        }
                        SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                            if doc.apply_remote(&update).is_ok() {
                                self.broadcast(&room, reply, update);
                            }
                        }
                    }
                }
            }
            Payload::Auth(_) | Payload::Other(_) => {}
        }
    }
}

impl ReplicationConnector for MemoryRelay {
    fn connect<'a>(
        &'a self,
        target: &'a ReplicationTarget,
    ) -> BoxFuture<'a, Result<ReplicationChannel>> {
        Box::pin(async move {
            let (outgoing, mut from_client) = mpsc::unbounded_channel::<Vec<u8>>();
            let (to_client, incoming) = mpsc::unbounded_channel();
            self.state
                .lock()
                .unwrap()
                .peers
                .push((target.room.clone(), to_client.clone()));

            let relay = self.clone();
            tokio::spawn(async move {
                while let Some(bytes) = from_client.recv().await {
                    relay.handle(&bytes, &to_client);
                }
            });
            Ok(ReplicationChannel { outgoing, incoming })
        })
    }
}

// ============================================================================
// ScriptedRemote
// ============================================================================

/// One scripted answer of [`ScriptedRemote`].
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Accept; temporary ids get a generated server id
    Accept,
    /// Accept and assign this id
    AssignId(String),
    /// Fail with a network error
    Transient,
    /// Reject with this HTTP status
    Reject(u16),
    /// Never answer
    Hang,
    /// Wait, then accept and assign this id
    Delayed(Duration, String),
}

#[derive(Default)]
struct ScriptState {
    script: VecDeque<Scripted>,
    calls: Vec<ChangeRequest>,
    lists: HashMap<String, Vec<Value>>,
}

/// Remote authority answering from a script, [`Scripted::Accept`] once it runs out.
#[derive(Clone, Default)]
pub struct ScriptedRemote {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRemote {
    /// Remote that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to a future call.
    pub fn push(&self, answer: Scripted) {
        self.state.lock().unwrap().script.push_back(answer);
    }

    /// Every change applied so far, in call order.
    pub fn calls(&self) -> Vec<ChangeRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Set what listing a workspace returns.
    pub fn set_list(&self, workspace_id: &str, items: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .lists
            .insert(workspace_id.to_string(), items);
    }
}

impl RemoteAuthority for ScriptedRemote {
    fn apply<'a>(&'a self, change: &'a ChangeRequest) -> BoxFuture<'a, Result<RemoteAck>> {
        let (answer, call_number) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(change.clone());
            (
                state.script.pop_front().unwrap_or(Scripted::Accept),
                state.calls.len(),
            )
        };

        Box::pin(async move {
            let id = match answer {
                Scripted::Accept
                    if change.operation == ChangeOperation::Create
                        && is_temp_id(&change.entity_id) =>
                {
                    format!("srv-{}", call_number)
                }
                Scripted::Accept => change.entity_id.clone(),
                Scripted::AssignId(id) => id,
                Scripted::Transient => {
                    return Err(SyncError::Network("scripted outage".to_string()));
                }
                Scripted::Reject(status) => {
                    return Err(SyncError::Rejected {
                        status,
                        message: "scripted rejection".to_string(),
                    });
                }
                Scripted::Hang => std::future::pending().await,
                Scripted::Delayed(delay, id) => {
                    tokio::time::sleep(delay).await;
                    id
                }
            };

            let entity = match &change.data {
                Value::Object(fields) => {
                    let mut fields = fields.clone();
                    fields.insert("id".into(), Value::String(id.clone()));
                    Some(Value::Object(fields))
                }
                _ => None,
            };
            Ok(RemoteAck { id, entity })
        })
    }

    fn list<'a>(
        &'a self,
        _entity_type: EntityType,
        workspace_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        let items = self
            .state
            .lock()
            .unwrap()
            .lists
            .get(workspace_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(items) })
    }
}

// ============================================================================
// FlakyStorage
// ============================================================================

/// Memory storage whose writes can be switched off, as a full or failing
/// disk would.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    /// Storage that accepts writes until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StorageProvider for FlakyStorage {
    fn backend(&self) -> StorageBackend {
        self.inner.backend()
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        self.inner.read(key)
    }

    fn write<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(async move {
                Err(SyncError::Durability(format!("write of {} failed", key)))
            });
        }
        self.inner.write(key, value)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        self.inner.delete(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        self.inner.list(prefix)
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.clear()
    }

    fn get_info(&self) -> BoxFuture<'_, Result<StorageInfo>> {
        self.inner.get_info()
    }
}
