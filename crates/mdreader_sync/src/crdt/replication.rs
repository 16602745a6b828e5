//! Real-time replication binding.
//!
//! A [`ReplicationBinding`] ties one open document to one room on the sync
//! server. It is opened only while the environment approves replication and
//! is torn down without touching local persistence. Connection failures
//! leave the document's `connected` flag false and never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use ts_rs::TS;

use super::document::SyncedDocument;
use super::persistence::PersistenceSink;
use super::protocol::{AuthMessage, Frame, Payload, SyncMessage};
use crate::BoxFuture;
use crate::environment::EnvironmentDetector;
use crate::error::{Result, SyncError};

/// Where a document replicates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTarget {
    /// Configured replication endpoint
    pub endpoint: String,
    /// Room name: the document id, verbatim
    pub room: String,
    /// Session token presented in the auth handshake
    pub token: Option<String>,
}

/// Replication state of a document as shown to the editing surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DocumentStatus {
    /// A replication connection is established
    pub connected: bool,
    /// The initial state exchange with the server completed
    pub synced: bool,
}

/// A bidirectional byte channel to the sync server.
pub struct ReplicationChannel {
    /// Frames to send
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames received
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Opens transport channels. The seam between replication logic and the network.
pub trait ReplicationConnector: Send + Sync {
    /// Connect to `target.endpoint`.
    fn connect<'a>(&'a self, target: &'a ReplicationTarget)
    -> BoxFuture<'a, Result<ReplicationChannel>>;
}

/// An open replication binding.
///
/// Dropping it ends the connection after queued local updates are sent;
/// [`close`](Self::close) ends it immediately.
pub struct ReplicationBinding {
    target: ReplicationTarget,
    local_updates: mpsc::UnboundedSender<Vec<u8>>,
    status: Arc<watch::Sender<DocumentStatus>>,
    task: JoinHandle<()>,
}

/// Everything a binding needs from its document handle.
pub struct BindingContext {
    /// The document to replicate
    pub document: Arc<SyncedDocument>,
    /// Marks the document dirty after remote updates
    pub persistence: PersistenceSink,
    /// Status published to the editing surface
    pub status: Arc<watch::Sender<DocumentStatus>>,
    /// Bound on connect plus auth handshake
    pub connect_timeout: Duration,
}

impl ReplicationBinding {
    /// Open a binding to `target`.
    ///
    /// Refuses with [`SyncError::PolicyViolation`] when the environment does
    /// not approve replication; callers are expected to have checked first.
    pub fn open(
        detector: &EnvironmentDetector,
        connector: Arc<dyn ReplicationConnector>,
        target: ReplicationTarget,
        context: BindingContext,
    ) -> Result<Self> {
        if !detector.should_use_cloud_sync() {
            let env = detector.get_environment();
            log::error!(
                "[Replication] Refusing binding for {}: environment is {:?}/{:?}",
                target.room,
                env.network,
                env.auth
            );
            return Err(SyncError::PolicyViolation(format!(
                "replication of {} requested while {:?}/{:?}",
                target.room, env.network, env.auth
            )));
        }

        log::info!(
            "[Replication] Opening {} at {}",
            target.room,
            target.endpoint
        );
        let (local_updates, local_rx) = mpsc::unbounded_channel();
        let status = Arc::clone(&context.status);
        let task = tokio::spawn(run(connector, target.clone(), context, local_rx));

        Ok(Self {
            target,
            local_updates,
            status,
            task,
        })
    }

    /// Where this binding replicates to.
    pub fn target(&self) -> &ReplicationTarget {
        &self.target
    }

    /// Whether the connection task has ended (closed, refused or failed).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Forward a local update to the server.
    pub fn send_local(&self, update: Vec<u8>) {
        if self.local_updates.send(update).is_err() {
            log::debug!(
                "[Replication] {} is not running, update stays local",
                self.target.room
            );
        }
    }

    /// Tear the binding down.
    pub fn close(self) {
        self.task.abort();
        self.status.send_modify(|s| *s = DocumentStatus::default());
        log::info!("[Replication] Closed {}", self.target.room);
    }
}

async fn run(
    connector: Arc<dyn ReplicationConnector>,
    target: ReplicationTarget,
    context: BindingContext,
    mut local_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let room = target.room.clone();
    let handshake = async {
        let mut channel = connector.connect(&target).await?;
        if let Some(token) = &target.token {
            authenticate(&mut channel, &room, token).await?;
        }
        Ok::<_, SyncError>(channel)
    };

    let mut channel = match tokio::time::timeout(context.connect_timeout, handshake).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            log::warn!("[Replication] {} stays offline: {}", room, e);
            return;
        }
        Err(_) => {
            log::warn!(
                "[Replication] {} connect timed out after {:?}",
                room,
                context.connect_timeout
            );
            return;
        }
    };

    context.status.send_modify(|s| s.connected = true);
    log::info!("[Replication] {} connected", room);

    let step1 = Frame::sync(
        room.clone(),
        SyncMessage::SyncStep1(context.document.encode_state_vector()),
    );
    if channel.outgoing.send(step1.encode()).is_ok() {
        loop {
            tokio::select! {
                incoming = channel.incoming.recv() => {
                    let Some(bytes) = incoming else {
                        log::info!("[Replication] {} connection closed by server", room);
                        break;
                    };
                    if !handle_frame(&bytes, &room, &context, &channel.outgoing) {
                        break;
                    }
                }
                update = local_rx.recv() => {
                    let Some(update) = update else { break };
                    let frame = Frame::sync(room.clone(), SyncMessage::Update(update));
                    if channel.outgoing.send(frame.encode()).is_err() {
                        break;
                    }
                }
            }
        }
    }

    context.status.send_modify(|s| *s = DocumentStatus::default());
    log::info!("[Replication] {} disconnected", room);
}

async fn authenticate(channel: &mut ReplicationChannel, room: &str, token: &str) -> Result<()> {
    let hello = Frame::auth(room, AuthMessage::Token(token.to_string()));
    channel
        .outgoing
        .send(hello.encode())
        .map_err(|_| SyncError::Network("connection closed during auth".to_string()))?;

    while let Some(bytes) = channel.incoming.recv().await {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) if frame.room == room => frame,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("[Replication] Ignoring undecodable frame: {}", e);
                continue;
            }
        };
        match frame.payload {
            Payload::Auth(AuthMessage::Authenticated(scope)) => {
                log::debug!("[Replication] {} authenticated ({})", room, scope);
                return Ok(());
            }
            Payload::Auth(AuthMessage::PermissionDenied(reason)) => {
                return Err(SyncError::Rejected {
                    status: 403,
                    message: reason,
                });
            }
            _ => continue,
        }
    }
    Err(SyncError::Network("connection closed during auth".to_string()))
}

/// Apply one incoming frame. Returns `false` when the binding should stop.
fn handle_frame(
    bytes: &[u8],
    room: &str,
    context: &BindingContext,
    outgoing: &mpsc::UnboundedSender<Vec<u8>>,
) -> bool {
    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("[Replication] {} dropped a bad frame: {}", room, e);
            return true;
        }
    };
    if frame.room != room {
        return true;
    }

    match frame.payload {
        Payload::Sync(messages) => {
            for message in messages {
                match message {
                    SyncMessage::SyncStep1(state_vector) => {
                        match context.document.encode_diff(&state_vector) {
                            Ok(diff) => {
                                let reply = Frame::sync(room, SyncMessage::SyncStep2(diff));
                                if outgoing.send(reply.encode()).is_err() {
                                    return false;
                                }
                            }
                            Err(e) => log::warn!("[Replication] {} bad SyncStep1: {}", room, e),
                        }
                    }
                    SyncMessage::SyncStep2(update) => {
                        if apply(context, room, &update) {
                            context.status.send_modify(|s| s.synced = true);
                            log::debug!("[Replication] {} synced", room);
                        }
                    }
                    SyncMessage::Update(update) => {
                        apply(context, room, &update);
                    }
                }
            }
            true
        }
        Payload::Auth(AuthMessage::PermissionDenied(reason)) => {
            log::warn!("[Replication] {} permission denied: {}", room, reason);
            false
        }
        Payload::Auth(_) | Payload::Other(_) => true,
    }
}

fn apply(context: &BindingContext, room: &str, update: &[u8]) -> bool {
    match context.document.apply_remote(update) {
        Ok(()) => {
            context.persistence.notify();
            true
        }
        Err(e) => {
            log::warn!("[Replication] {} rejected remote update: {}", room, e);
            false
        }
    }
}

// ============================================================================
// WebSocket transport (native-sync)
// ============================================================================

/// Connector speaking binary WebSocket frames, one connection per binding.
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
impl ReplicationConnector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        target: &'a ReplicationTarget,
    ) -> BoxFuture<'a, Result<ReplicationChannel>> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        Box::pin(async move {
            let (ws_stream, _) = connect_async(target.endpoint.as_str())
                .await
                .map_err(|e| SyncError::Network(format!("WebSocket connection failed: {}", e)))?;
            log::debug!("[WebSocket] Connected to {}", target.endpoint);

            let (mut write, mut read) = ws_stream.split();
            let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (incoming_tx, incoming) = mpsc::unbounded_channel();
            let room = target.room.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Binary(data))) => {
                                    if incoming_tx.send(data.to_vec()).is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::warn!("[WebSocket] {} read error: {}", room, e);
                                    break;
                                }
                            }
                        }
                        frame = outgoing_rx.recv() => {
                            let Some(frame) = frame else { break };
                            if let Err(e) = write.send(Message::Binary(frame.into())).await {
                                log::warn!("[WebSocket] {} send error: {}", room, e);
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            if let Err(e) = write.send(Message::Ping(Default::default())).await {
                                log::warn!("[WebSocket] {} ping failed: {}", room, e);
                                break;
                            }
                        }
                    }
                }
                let _ = write.close().await;
                log::debug!("[WebSocket] {} transport closed", room);
            });

            Ok(ReplicationChannel { outgoing, incoming })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::persistence::LocalPersistence;
    use crate::environment::{NetworkStatus, StaticProbe};
    use crate::storage::{MemoryStorage, StorageProvider};
    use crate::test_utils::{MemoryRelay, RecordingConnector, wait_for};

    async fn approved_detector() -> EnvironmentDetector {
        let detector = EnvironmentDetector::new(Arc::new(StaticProbe::online_as("u1")));
        detector.init(&MemoryStorage::new()).await.unwrap();
        detector
    }

    async fn context() -> (BindingContext, watch::Receiver<DocumentStatus>, LocalPersistence) {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
        let (document, persistence) = LocalPersistence::attach(storage, "k").await.unwrap();
        let (status, rx) = watch::channel(DocumentStatus::default());
        let context = BindingContext {
            document,
            persistence: persistence.sink(),
            status: Arc::new(status),
            connect_timeout: Duration::from_secs(2),
        };
        (context, rx, persistence)
    }

    fn target(room: &str, token: Option<&str>) -> ReplicationTarget {
        ReplicationTarget {
            endpoint: "ws://relay.test/collab".to_string(),
            room: room.to_string(),
            token: token.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_open_refused_when_policy_disapproves() {
        let detector = approved_detector().await;
        detector.set_network(NetworkStatus::Offline);
        let connector = RecordingConnector::new();
        let (ctx, _rx, _persistence) = context().await;

        let result = ReplicationBinding::open(
            &detector,
            Arc::new(connector.clone()),
            target("doc-1", None),
            ctx,
        );
        assert!(matches!(result, Err(SyncError::PolicyViolation(_))));
        assert!(connector.targets().is_empty());
    }

    #[tokio::test]
    async fn test_syncs_with_relay() {
        let detector = approved_detector().await;
        let relay = MemoryRelay::new();
        relay.seed("doc-1", |doc| {
            doc.insert_text(0, "from server").unwrap();
        });

        let (ctx, mut status, _persistence) = context().await;
        let document = Arc::clone(&ctx.document);
        let binding = ReplicationBinding::open(
            &detector,
            Arc::new(relay.clone()),
            target("doc-1", Some("token")),
            ctx,
        )
        .unwrap();

        wait_for(&mut status, |s| s.synced).await;
        assert!(status.borrow().connected);
        assert_eq!(document.content(), "from server");

        let update = document.insert_text(0, ">> ").unwrap();
        binding.send_local(update);
        relay
            .wait_until("doc-1", |doc| doc.content() == ">> from server")
            .await;

        binding.close();
        assert_eq!(*status.borrow(), DocumentStatus::default());
    }

    #[tokio::test]
    async fn test_permission_denied_stays_offline() {
        let detector = approved_detector().await;
        let relay = MemoryRelay::new();
        relay.deny_token("bad");

        let (ctx, status, _persistence) = context().await;
        let binding = ReplicationBinding::open(
            &detector,
            Arc::new(relay.clone()),
            target("doc-1", Some("bad")),
            ctx,
        )
        .unwrap();

        for _ in 0..100 {
            if binding.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(binding.is_finished());
        assert!(!status.borrow().connected);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_flags_false() {
        let detector = approved_detector().await;
        let connector = RecordingConnector::refusing();
        let (ctx, status, _persistence) = context().await;

        let binding = ReplicationBinding::open(
            &detector,
            Arc::new(connector.clone()),
            target("doc-1", None),
            ctx,
        )
        .unwrap();
        for _ in 0..100 {
            if binding.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(binding.is_finished());
        assert_eq!(*status.borrow(), DocumentStatus::default());
        assert_eq!(connector.targets(), vec![target("doc-1", None)]);
    }

    #[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
    #[tokio::test]
    async fn test_websocket_connector_speaks_tls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Hang up on the TLS handshake
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let mut secure = target("doc-1", None);
        secure.endpoint = format!("wss://127.0.0.1:{}/collab", port);
        let err = match WebSocketConnector.connect(&secure).await {
            Ok(_) => panic!("handshake against a closed socket succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, SyncError::Network(_)));
        assert!(!err.to_string().contains("TLS support not compiled in"));
    }
}
