//! The offline change queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::remote::{RemoteAck, RemoteAuthority};
use super::store::QueueState;
use super::types::{
    ChangeOperation, ChangeRequest, DeadLetter, EntityType, Enqueued, PendingChange,
    QueueEvent, Reconciliation, is_temp_id,
};
use crate::BoxFuture;
use crate::config::SyncConfig;
use crate::environment::EnvironmentDetector;
use crate::error::{Result, SyncError};
use crate::storage::StorageProvider;

/// Receiver of queue events. Dropping it unsubscribes.
pub type QueueSubscription = mpsc::UnboundedReceiver<QueueEvent>;

/// A local copy of remote entities that must follow id reconciliation.
pub trait LocalMirror: Send + Sync {
    /// Entities this mirror holds.
    fn entity_type(&self) -> EntityType;

    /// Re-key `old_id` as `new_id`, including references such as parent ids.
    /// Returns the reconciled record, if the mirror has one.
    fn reconcile<'a>(
        &'a self,
        workspace_id: &'a str,
        old_id: &'a str,
        new_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>>>;

    /// Every queued change of `entity_id` reached the remote.
    fn mark_synced<'a>(
        &'a self,
        workspace_id: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// The create of temporary entity `entity_id` was dead-lettered, so the
    /// entity will not exist remotely. Drop the local copy.
    fn discard<'a>(
        &'a self,
        workspace_id: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Summary of one [`flush`](OfflineChangeQueue::flush).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records acknowledged by the remote
    pub replayed: usize,
    /// Temporary ids replaced
    pub reconciled: usize,
    /// Records given up on
    pub dead_lettered: usize,
    /// Records still queued afterwards
    pub remaining: usize,
    /// Stopped early: offline, or a transient failure
    pub deferred: bool,
}

struct Shared {
    state: QueueState,
    /// Record currently being sent to the remote
    in_flight: Option<PendingChange>,
}

struct QueueInner {
    storage: Arc<dyn StorageProvider>,
    detector: Arc<EnvironmentDetector>,
    remote: Arc<dyn RemoteAuthority>,
    shared: tokio::sync::Mutex<Shared>,
    flushing: tokio::sync::Mutex<()>,
    mirrors: Mutex<Vec<Arc<dyn LocalMirror>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    replay_timeout: Duration,
    max_attempts: u32,
}

/// Durable, ordered record of structural mutations awaiting the remote.
///
/// Cloning is cheap and every clone drives the same queue.
#[derive(Clone)]
pub struct OfflineChangeQueue {
    inner: Arc<QueueInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OfflineChangeQueue {
    /// Load the persisted queue.
    pub async fn open(
        storage: Arc<dyn StorageProvider>,
        detector: Arc<EnvironmentDetector>,
        remote: Arc<dyn RemoteAuthority>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let state = QueueState::load(storage.as_ref()).await?;
        log::info!(
            "[OfflineQueue] Loaded {} pending, {} dead-lettered",
            state.records().len(),
            state.dead_letters().len()
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                storage,
                detector,
                remote,
                shared: tokio::sync::Mutex::new(Shared {
                    state,
                    in_flight: None,
                }),
                flushing: tokio::sync::Mutex::new(()),
                mirrors: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                replay_timeout: config.replay_timeout(),
                max_attempts: config.max_replay_attempts.max(1),
            }),
        })
    }

    /// Keep `mirror` in step with reconciliations.
    pub fn register_mirror(&self, mirror: Arc<dyn LocalMirror>) {
        lock(&self.inner.mirrors).push(mirror);
    }

    /// Receive every subsequent queue event.
    pub fn subscribe(&self) -> QueueSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    fn emit(&self, event: QueueEvent) {
        lock(&self.inner.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn mirrors_for(&self, entity_type: EntityType) -> Vec<Arc<dyn LocalMirror>> {
        lock(&self.inner.mirrors)
            .iter()
            .filter(|mirror| mirror.entity_type() == entity_type)
            .cloned()
            .collect()
    }

    // ==================== Enqueue ====================

    /// Durably append a change. Visible to [`pending`](Self::pending) as soon
    /// as this returns; replayed in the background when connected.
    ///
    /// Temporary ids that were already reconciled are replaced by their
    /// server ids first. A delete of an entity whose create was never sent
    /// drops every queued record of that entity instead. Any other record
    /// naming a temporary id without a queued create is refused with
    /// [`SyncError::InvalidOperation`], as it could never be replayed.
    pub async fn queue_change(&self, mut request: ChangeRequest) -> Result<Enqueued> {
        let outcome = {
            let mut shared = self.inner.shared.lock().await;
            shared.state.resolve_aliases(&mut request);
            let create_in_flight = shared.in_flight.as_ref().is_some_and(|c| {
                c.entity_id() == request.entity_id && c.operation() == ChangeOperation::Create
            });
            let is_delete = request.operation == ChangeOperation::Delete;

            // Mutate a copy so a failed write leaves the queue as it was
            let mut next = shared.state.clone();
            let outcome = match next.missing_create(&request) {
                _ if is_delete && !create_in_flight && next.has_queued_create(&request.entity_id) => {
                    let removed = next.remove_entity(&request.entity_id).len();
                    Enqueued::Cancelled { removed }
                }
                Some(missing) if is_delete && missing == request.entity_id => {
                    let removed = next.remove_entity(&request.entity_id).len();
                    Enqueued::Cancelled { removed }
                }
                Some(missing) => {
                    return Err(SyncError::InvalidOperation(format!(
                        "{} {} depends on {}, which has no queued create",
                        request.operation, request.entity_id, missing
                    )));
                }
                None => Enqueued::Queued(next.push(request.clone())),
            };
            next.save(self.inner.storage.as_ref()).await?;
            shared.state = next;
            outcome
        };

        match outcome {
            Enqueued::Queued(seq) => {
                log::debug!(
                    "[OfflineQueue] Queued #{} {} {} {}",
                    seq,
                    request.operation,
                    request.entity_type,
                    request.entity_id
                );
                if self.is_connected() {
                    self.schedule_flush();
                }
            }
            Enqueued::Cancelled { removed } => log::info!(
                "[OfflineQueue] {} {} was never created remotely, dropped {} records",
                request.entity_type,
                request.entity_id,
                removed
            ),
        }
        Ok(outcome)
    }

    /// Whether changes can be sent right now.
    pub fn is_connected(&self) -> bool {
        self.inner.detector.should_use_cloud_sync() && self.inner.remote.is_available()
    }

    /// Whether `request` has to wait behind queued records: its entity
    /// already has some, or it references an entity whose create is queued.
    pub async fn has_dependencies(&self, request: &ChangeRequest) -> bool {
        let shared = self.inner.shared.lock().await;
        shared.state.records().iter().any(|r| {
            r.entity_id() == request.entity_id
                || (r.operation() == ChangeOperation::Create
                    && (request.references(r.entity_id()) || request.workspace_id == r.entity_id()))
        })
    }

    /// Replace temporary ids the queue has already reconciled.
    pub(crate) async fn resolve_aliases(&self, request: &mut ChangeRequest) {
        self.inner.shared.lock().await.state.resolve_aliases(request);
    }

    /// Announce a reconciliation done outside replay (a direct write).
    pub(crate) fn publish_reconciled(&self, reconciliation: Reconciliation) {
        self.emit(QueueEvent::Reconciled(reconciliation));
    }

    fn schedule_flush(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.flush().await {
                log::error!("[OfflineQueue] Background replay failed: {}", e);
            }
        });
    }

    // ==================== Replay ====================

    /// Replay ready records until the queue is drained, the environment stops
    /// approving, or a transient failure defers the rest.
    ///
    /// Only one flush runs at a time; concurrent callers wait their turn.
    /// Remote failures never surface here, only through [`QueueEvent`]s.
    /// An error means the queue could not be persisted.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _flushing = self.inner.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            if !self.is_connected() {
                report.deferred = true;
                break;
            }

            let (next, orphans) = {
                let mut shared = self.inner.shared.lock().await;
                let mut state = shared.state.clone();
                let orphans = state.dead_letter_orphans();
                if !orphans.is_empty() {
                    state.save(self.inner.storage.as_ref()).await?;
                    shared.state = state;
                }
                let next = shared.state.next_ready().cloned();
                shared.in_flight = next.clone();
                (next, orphans)
            };
            self.publish_dead_letters(orphans, &mut report).await;
            let Some(change) = next else { break };

            let outcome = match tokio::time::timeout(
                self.inner.replay_timeout,
                self.inner.remote.apply(&change.request),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(SyncError::Timeout(
                    self.inner.replay_timeout.as_millis() as u64,
                )),
            };

            match outcome {
                Ok(ack) => self.acknowledge(&change, ack, &mut report).await?,
                Err(e) if e.is_transient() => {
                    if !self.record_transient(&change, &e, &mut report).await? {
                        report.deferred = true;
                        break;
                    }
                }
                Err(e) => self.reject(&change, &e, &mut report).await?,
            }
        }

        self.inner.shared.lock().await.in_flight = None;
        report.remaining = self.len().await;
        if report.replayed > 0 || report.dead_lettered > 0 {
            log::info!(
                "[OfflineQueue] Flush: {} replayed, {} reconciled, {} dead-lettered, {} remaining",
                report.replayed,
                report.reconciled,
                report.dead_lettered,
                report.remaining
            );
        }
        Ok(report)
    }

    async fn acknowledge(
        &self,
        change: &PendingChange,
        ack: RemoteAck,
        report: &mut FlushReport,
    ) -> Result<()> {
        let request = &change.request;
        let reconciled = request.operation == ChangeOperation::Create && ack.id != request.entity_id;

        let still_pending = {
            let mut shared = self.inner.shared.lock().await;
            shared.in_flight = None;
            let mut next = shared.state.clone();
            next.remove(change.seq);
            if reconciled {
                let rewritten = next.reconcile(&request.entity_id, &ack.id);
                log::debug!(
                    "[OfflineQueue] {} -> {}, rewrote {} queued records",
                    request.entity_id,
                    ack.id,
                    rewritten
                );
            }
            let still_pending = next.has_pending_for(&ack.id);
            next.save(self.inner.storage.as_ref()).await?;
            shared.state = next;
            still_pending
        };
        report.replayed += 1;

        let mirrors = self.mirrors_for(request.entity_type);
        if reconciled {
            let mut entity = None;
            for mirror in &mirrors {
                match mirror
                    .reconcile(&request.workspace_id, &request.entity_id, &ack.id)
                    .await
                {
                    Ok(Some(record)) => entity = Some(record),
                    Ok(None) => {}
                    Err(e) => log::error!(
                        "[OfflineQueue] Mirror failed to reconcile {}: {}",
                        request.entity_id,
                        e
                    ),
                }
            }
            report.reconciled += 1;
            self.emit(QueueEvent::Reconciled(Reconciliation {
                entity_type: request.entity_type,
                workspace_id: request.workspace_id.clone(),
                old_id: request.entity_id.clone(),
                new_id: ack.id.clone(),
                entity: entity.or(ack.entity),
            }));
        }

        if !still_pending && request.operation != ChangeOperation::Delete {
            for mirror in &mirrors {
                if let Err(e) = mirror.mark_synced(&request.workspace_id, &ack.id).await {
                    log::error!("[OfflineQueue] Mirror failed to mark {} synced: {}", ack.id, e);
                }
            }
        }

        self.emit(QueueEvent::Replayed {
            seq: change.seq,
            entity_type: request.entity_type,
            entity_id: request.entity_id.clone(),
            operation: request.operation,
        });
        Ok(())
    }

    /// Count a transient failure. Returns `true` if the record was
    /// dead-lettered, which lets the flush carry on with other records.
    async fn record_transient(
        &self,
        change: &PendingChange,
        error: &SyncError,
        report: &mut FlushReport,
    ) -> Result<bool> {
        let letters = {
            let mut shared = self.inner.shared.lock().await;
            shared.in_flight = None;
            let mut next = shared.state.clone();
            let Some(record) = next.get_mut(change.seq) else {
                return Ok(false);
            };
            record.attempt_count += 1;
            record.last_error = Some(error.to_string());
            let attempts = record.attempt_count;

            let letters = if attempts >= self.inner.max_attempts {
                next.dead_letter(
                    change.seq,
                    &format!("gave up after {} attempts: {}", attempts, error),
                    rejection_status(error),
                )
            } else {
                log::warn!(
                    "[OfflineQueue] #{} failed (attempt {}/{}), will retry: {}",
                    change.seq,
                    attempts,
                    self.inner.max_attempts,
                    error
                );
                Vec::new()
            };
            next.save(self.inner.storage.as_ref()).await?;
            shared.state = next;
            letters
        };

        let exhausted = !letters.is_empty();
        self.publish_dead_letters(letters, report).await;
        Ok(exhausted)
    }

    async fn reject(
        &self,
        change: &PendingChange,
        error: &SyncError,
        report: &mut FlushReport,
    ) -> Result<()> {
        let letters = {
            let mut shared = self.inner.shared.lock().await;
            shared.in_flight = None;
            let mut next = shared.state.clone();
            let letters = next.dead_letter(change.seq, &error.to_string(), rejection_status(error));
            next.save(self.inner.storage.as_ref()).await?;
            shared.state = next;
            letters
        };
        self.publish_dead_letters(letters, report).await;
        Ok(())
    }

    /// Announce committed dead letters and drop the local copies of
    /// temporary entities whose create failed.
    async fn publish_dead_letters(&self, letters: Vec<DeadLetter>, report: &mut FlushReport) {
        for letter in letters {
            let request = &letter.change.request;
            if request.operation == ChangeOperation::Create && is_temp_id(&request.entity_id) {
                for mirror in self.mirrors_for(request.entity_type) {
                    if let Err(e) = mirror
                        .discard(&request.workspace_id, &request.entity_id)
                        .await
                    {
                        log::error!(
                            "[OfflineQueue] Mirror failed to discard {}: {}",
                            request.entity_id,
                            e
                        );
                    }
                }
            }

            log::error!(
                "[OfflineQueue] Dead-lettered #{} {} {} {}: {}",
                letter.change.seq,
                letter.change.request.operation,
                letter.change.request.entity_type,
                letter.change.entity_id(),
                letter.reason
            );
            report.dead_lettered += 1;
            self.emit(QueueEvent::DeadLettered(letter));
        }
    }

    // ==================== Replay on reconnect ====================

    /// Flush now if connected, then again on every transition to an approved
    /// environment. Idempotent.
    pub fn start(&self) {
        let mut listener = lock(&self.inner.listener);
        if listener.is_some() {
            return;
        }

        let mut changes = self.inner.detector.subscribe();
        let mut approved = self.inner.detector.should_use_cloud_sync();
        if self.is_connected() {
            self.schedule_flush();
        }

        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(async move {
            while let Some(env) = changes.recv().await {
                let now = env.should_use_cloud_sync();
                if now && !approved {
                    let Some(inner) = weak.upgrade() else { break };
                    let queue = OfflineChangeQueue { inner };
                    log::info!("[OfflineQueue] Connected, replaying");
                    if let Err(e) = queue.flush().await {
                        log::error!("[OfflineQueue] Replay on reconnect failed: {}", e);
                    }
                }
                approved = now;
            }
        }));
    }

    /// Stop replaying on reconnect.
    pub fn stop(&self) {
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.abort();
        }
    }

    // ==================== Inspection ====================

    /// Every pending record, in creation order.
    pub async fn pending(&self) -> Vec<PendingChange> {
        self.inner.shared.lock().await.state.records().to_vec()
    }

    /// Pending records of one entity, in creation order.
    pub async fn pending_for(&self, entity_id: &str) -> Vec<PendingChange> {
        self.inner
            .shared
            .lock()
            .await
            .state
            .records()
            .iter()
            .filter(|r| r.entity_id() == entity_id)
            .cloned()
            .collect()
    }

    /// Number of pending records.
    pub async fn len(&self) -> usize {
        self.inner.shared.lock().await.state.records().len()
    }

    /// Whether nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Records that will not be retried automatically.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.shared.lock().await.state.dead_letters().to_vec()
    }

    /// Put a dead-lettered record back in the queue with a fresh attempt
    /// count. Returns its new sequence number.
    pub async fn retry_dead_letter(&self, seq: u64) -> Result<u64> {
        let new_seq = {
            let mut shared = self.inner.shared.lock().await;
            let mut next = shared.state.clone();
            let letter = next
                .take_dead(seq)
                .ok_or_else(|| SyncError::NotFound(format!("dead letter #{}", seq)))?;
            let new_seq = next.push(letter.change.request);
            next.save(self.inner.storage.as_ref()).await?;
            shared.state = next;
            new_seq
        };
        log::info!("[OfflineQueue] Retrying dead letter #{} as #{}", seq, new_seq);
        if self.is_connected() {
            self.schedule_flush();
        }
        Ok(new_seq)
    }

    /// Drop a dead-lettered record. Returns whether it existed.
    pub async fn discard_dead_letter(&self, seq: u64) -> Result<bool> {
        let mut shared = self.inner.shared.lock().await;
        let mut next = shared.state.clone();
        if next.take_dead(seq).is_none() {
            return Ok(false);
        }
        next.save(self.inner.storage.as_ref()).await?;
        shared.state = next;
        Ok(true)
    }
}

fn rejection_status(error: &SyncError) -> Option<u16> {
    match error {
        SyncError::Rejected { status, .. } => Some(*status),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{NetworkStatus, StaticProbe};
    use crate::storage::MemoryStorage;
    use crate::test_utils::{FlakyStorage, Scripted, ScriptedRemote, next_event};
    use serde_json::json;

    struct Fixture {
        queue: OfflineChangeQueue,
        remote: ScriptedRemote,
        detector: Arc<EnvironmentDetector>,
        storage: Arc<dyn StorageProvider>,
    }

    async fn fixture(probe: StaticProbe) -> Fixture {
        fixture_on(probe, Arc::new(MemoryStorage::new()), 100).await
    }

    async fn fixture_on(
        probe: StaticProbe,
        storage: Arc<dyn StorageProvider>,
        replay_timeout_ms: u64,
    ) -> Fixture {
        let detector = Arc::new(EnvironmentDetector::new(Arc::new(probe)));
        detector.init(storage.as_ref()).await.unwrap();
        let remote = ScriptedRemote::new();
        let config = SyncConfig {
            replay_timeout_ms,
            max_replay_attempts: 3,
            ..SyncConfig::default()
        };
        let queue = OfflineChangeQueue::open(
            Arc::clone(&storage),
            Arc::clone(&detector),
            Arc::new(remote.clone()),
            &config,
        )
        .await
        .unwrap();
        Fixture {
            queue,
            remote,
            detector,
            storage,
        }
    }

    fn go_online(detector: &EnvironmentDetector) {
        detector.set_network(NetworkStatus::Online);
        detector.on_login("u1");
    }

    fn folder(id: &str, operation: ChangeOperation, data: Value) -> ChangeRequest {
        ChangeRequest::new(EntityType::Folder, id, "ws", operation, data)
    }

    #[tokio::test]
    async fn test_offline_queue_persists_without_replay() {
        let f = fixture(StaticProbe::offline()).await;
        let outcome = f
            .queue
            .queue_change(folder("f1", ChangeOperation::Update, json!({"name": "x"})))
            .await
            .unwrap();

        assert_eq!(outcome, Enqueued::Queued(0));
        assert_eq!(f.queue.len().await, 1);
        let report = f.queue.flush().await.unwrap();
        assert!(report.deferred);
        assert!(f.remote.calls().is_empty());

        // A fresh queue over the same storage sees the record
        let reopened = OfflineChangeQueue::open(
            Arc::clone(&f.storage),
            Arc::clone(&f.detector),
            Arc::new(ScriptedRemote::new()),
            &SyncConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.pending().await, f.queue.pending().await);
    }

    #[tokio::test]
    async fn test_create_then_update_replays_with_server_id() {
        let f = fixture(StaticProbe::offline()).await;
        let mut events = f.queue.subscribe();
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({"name": "A"})))
            .await
            .unwrap();
        f.queue
            .queue_change(
                folder("temp-folder-a", ChangeOperation::Update, json!({"name": "B"}))
                    .with_priority(crate::queue::Priority::High),
            )
            .await
            .unwrap();

        f.remote.push(Scripted::AssignId("srv-1".into()));
        go_online(&f.detector);
        let report = f.queue.flush().await.unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.remaining, 0);
        let calls = f.remote.calls();
        assert_eq!(calls[0].operation, ChangeOperation::Create);
        assert_eq!(calls[0].entity_id, "temp-folder-a");
        assert_eq!(calls[1].operation, ChangeOperation::Update);
        assert_eq!(calls[1].entity_id, "srv-1");

        match next_event(&mut events).await {
            QueueEvent::Reconciled(r) => {
                assert_eq!(r.old_id, "temp-folder-a");
                assert_eq!(r.new_id, "srv-1");
                assert_eq!(r.event_name(), "folder-synced");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_dead_letters() {
        let f = fixture(StaticProbe::online_as("u1")).await;
        f.remote.push(Scripted::Transient);
        f.remote.push(Scripted::Transient);
        f.remote.push(Scripted::Hang);

        // Online: the enqueue itself schedules a replay, so wait for the
        // explicit flushes to take their turn behind it.
        f.queue
            .queue_change(folder("f1", ChangeOperation::Update, json!({"name": "x"})))
            .await
            .unwrap();
        let mut events = f.queue.subscribe();

        let mut attempts = 0;
        while f.queue.dead_letters().await.is_empty() {
            f.queue.flush().await.unwrap();
            attempts += 1;
            assert!(attempts <= 3, "never dead-lettered");
        }

        let letters = f.queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].change.attempt_count, 3);
        assert!(letters[0].reason.contains("gave up after 3 attempts"));
        assert!(f.queue.is_empty().await);
        assert!(matches!(
            next_event(&mut events).await,
            QueueEvent::DeadLettered(_)
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_record_and_stops_flush() {
        let f = fixture(StaticProbe::offline()).await;
        f.queue
            .queue_change(folder("f1", ChangeOperation::Update, json!({})))
            .await
            .unwrap();
        f.queue
            .queue_change(folder("f2", ChangeOperation::Update, json!({})))
            .await
            .unwrap();

        f.remote.push(Scripted::Transient);
        go_online(&f.detector);
        let report = f.queue.flush().await.unwrap();

        assert!(report.deferred);
        assert_eq!(report.replayed, 0);
        assert_eq!(f.remote.calls().len(), 1);
        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempt_count, 1);
        assert!(pending[0].last_error.is_some());

        // Next flush succeeds for both
        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.replayed, 2);
    }

    #[tokio::test]
    async fn test_rejected_create_cascades_and_is_surfaced() {
        let f = fixture(StaticProbe::offline()).await;
        let mut events = f.queue.subscribe();
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({"name": ""})))
            .await
            .unwrap();
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Update, json!({"name": "b"})))
            .await
            .unwrap();
        f.queue
            .queue_change(folder("f2", ChangeOperation::Update, json!({"name": "c"})))
            .await
            .unwrap();

        f.remote.push(Scripted::Reject(422));
        go_online(&f.detector);
        let report = f.queue.flush().await.unwrap();

        assert_eq!(report.dead_lettered, 2);
        assert_eq!(report.replayed, 1);
        assert_eq!(f.remote.calls().len(), 2);
        match next_event(&mut events).await {
            QueueEvent::DeadLettered(letter) => {
                assert_eq!(letter.status, Some(422));
                assert_eq!(letter.change.entity_id(), "temp-folder-a");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let seq = f.queue.dead_letters().await[0].change.seq;
        assert!(f.queue.discard_dead_letter(seq).await.unwrap());
        assert!(!f.queue.discard_dead_letter(seq).await.unwrap());
        assert_eq!(f.queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_dead_letter_requeues() {
        let f = fixture(StaticProbe::offline()).await;
        f.queue
            .queue_change(folder("f1", ChangeOperation::Delete, Value::Null))
            .await
            .unwrap();
        f.remote.push(Scripted::Reject(409));
        go_online(&f.detector);
        f.queue.flush().await.unwrap();
        f.detector.set_network(NetworkStatus::Offline);

        let seq = f.queue.dead_letters().await[0].change.seq;
        let new_seq = f.queue.retry_dead_letter(seq).await.unwrap();
        assert!(new_seq > seq);
        assert!(f.queue.dead_letters().await.is_empty());
        assert_eq!(f.queue.pending().await[0].attempt_count, 0);
        assert!(matches!(
            f.queue.retry_dead_letter(seq).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_of_unsent_create_cancels() {
        let f = fixture(StaticProbe::offline()).await;
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({})))
            .await
            .unwrap();
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Update, json!({})))
            .await
            .unwrap();

        let outcome = f
            .queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Delete, Value::Null))
            .await
            .unwrap();
        assert_eq!(outcome, Enqueued::Cancelled { removed: 2 });
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back() {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::with_quota(200));
        let detector = Arc::new(EnvironmentDetector::new(Arc::new(StaticProbe::offline())));
        detector.init(storage.as_ref()).await.unwrap();
        let queue = OfflineChangeQueue::open(
            storage,
            detector,
            Arc::new(ScriptedRemote::new()),
            &SyncConfig::default(),
        )
        .await
        .unwrap();

        let err = queue
            .queue_change(folder("f1", ChangeOperation::Update, json!({"name": "x".repeat(500)})))
            .await
            .unwrap_err();
        assert!(err.is_durability());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_replays_on_reconnect() {
        let f = fixture(StaticProbe::offline()).await;
        f.queue.start();
        f.queue.start();
        let mut events = f.queue.subscribe();
        f.queue
            .queue_change(folder("f1", ChangeOperation::Update, json!({"name": "x"})))
            .await
            .unwrap();

        go_online(&f.detector);
        assert!(matches!(
            next_event(&mut events).await,
            QueueEvent::Replayed { seq: 0, .. }
        ));
        assert!(f.queue.is_empty().await);
        f.queue.stop();
    }

    #[tokio::test]
    async fn test_record_for_unknown_temp_id_is_refused() {
        let f = fixture(StaticProbe::offline()).await;
        let err = f
            .queue
            .queue_change(folder("temp-folder-x", ChangeOperation::Update, json!({"name": "y"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let err = f
            .queue
            .queue_change(folder(
                "temp-folder-c",
                ChangeOperation::Create,
                json!({"parent_id": "temp-folder-x"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        // Deleting something that never existed remotely is a no-op
        let outcome = f
            .queue
            .queue_change(folder("temp-folder-x", ChangeOperation::Delete, Value::Null))
            .await
            .unwrap();
        assert_eq!(outcome, Enqueued::Cancelled { removed: 0 });
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_edit_after_create_dead_lettered_never_sticks() {
        let f = fixture(StaticProbe::offline()).await;
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({"name": "A"})))
            .await
            .unwrap();
        f.remote.push(Scripted::Reject(422));
        go_online(&f.detector);
        assert_eq!(f.queue.flush().await.unwrap().dead_lettered, 1);

        let err = f
            .queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Update, json!({"name": "B"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.remaining, 0);
        assert!(f.queue.is_empty().await);
        assert_eq!(f.queue.dead_letters().await.len(), 1);
        assert_eq!(f.remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_child_of_rejected_create_is_dead_lettered() {
        let f = fixture(StaticProbe::offline()).await;
        let mut events = f.queue.subscribe();
        f.queue
            .queue_change(folder("temp-folder-p", ChangeOperation::Create, json!({"name": ""})))
            .await
            .unwrap();
        f.queue
            .queue_change(folder(
                "temp-folder-c",
                ChangeOperation::Create,
                json!({"name": "c", "parent_id": "temp-folder-p"}),
            ))
            .await
            .unwrap();

        f.remote.push(Scripted::Reject(422));
        go_online(&f.detector);
        let report = f.queue.flush().await.unwrap();

        assert_eq!(report.dead_lettered, 2);
        assert_eq!(report.remaining, 0);
        // The child was never sent with a dangling parent
        assert_eq!(f.remote.calls().len(), 1);
        next_event(&mut events).await;
        match next_event(&mut events).await {
            QueueEvent::DeadLettered(letter) => {
                assert_eq!(letter.change.entity_id(), "temp-folder-c");
                assert!(letter.reason.contains("temp-folder-p"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_during_create_in_flight_replays_with_server_id() {
        let f = fixture_on(StaticProbe::offline(), Arc::new(MemoryStorage::new()), 5_000).await;
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({"name": "A"})))
            .await
            .unwrap();
        f.remote.push(Scripted::Delayed(
            Duration::from_millis(300),
            "srv-1".to_string(),
        ));
        go_online(&f.detector);

        let queue = f.queue.clone();
        let flush = tokio::spawn(async move { queue.flush().await });
        while f.remote.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The create is on the wire: the delete cannot cancel it
        let outcome = f
            .queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Delete, Value::Null))
            .await
            .unwrap();
        assert!(matches!(outcome, Enqueued::Queued(_)));

        let report = flush.await.unwrap().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 0);
        let calls = f.remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].operation, ChangeOperation::Delete);
        assert_eq!(calls[1].entity_id, "srv-1");
    }

    #[tokio::test]
    async fn test_late_record_with_reconciled_temp_id_uses_server_id() {
        let f = fixture(StaticProbe::offline()).await;
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({"name": "A"})))
            .await
            .unwrap();
        f.remote.push(Scripted::AssignId("srv-1".into()));
        go_online(&f.detector);
        f.queue.flush().await.unwrap();
        f.detector.set_network(NetworkStatus::Offline);

        // A writer that still holds the temporary id
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Update, json!({"name": "B"})))
            .await
            .unwrap();
        let pending = f.queue.pending().await;
        assert_eq!(pending[0].entity_id(), "srv-1");

        // The mapping survives a restart
        let reopened = OfflineChangeQueue::open(
            Arc::clone(&f.storage),
            Arc::clone(&f.detector),
            Arc::new(ScriptedRemote::new()),
            &SyncConfig::default(),
        )
        .await
        .unwrap();
        reopened
            .queue_change(folder(
                "f2",
                ChangeOperation::Update,
                json!({"parent_id": "temp-folder-a"}),
            ))
            .await
            .unwrap();
        assert_eq!(reopened.pending().await[1].request.data["parent_id"], "srv-1");
    }

    #[tokio::test]
    async fn test_failed_ack_bookkeeping_keeps_memory_and_disk_in_step() {
        let storage = Arc::new(FlakyStorage::new());
        let f = fixture_on(StaticProbe::offline(), storage.clone(), 100).await;
        f.queue
            .queue_change(folder("temp-folder-a", ChangeOperation::Create, json!({"name": "A"})))
            .await
            .unwrap();

        storage.fail_writes(true);
        f.remote.push(Scripted::AssignId("srv-1".into()));
        go_online(&f.detector);
        let err = f.queue.flush().await.unwrap_err();
        assert!(err.is_durability());

        // Still queued in memory, exactly as on disk
        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id(), "temp-folder-a");
        let reopened = OfflineChangeQueue::open(
            Arc::clone(&f.storage),
            Arc::clone(&f.detector),
            Arc::new(ScriptedRemote::new()),
            &SyncConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.pending().await, pending);

        storage.fail_writes(false);
        let report = f.queue.flush().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_reject_bookkeeping_keeps_record() {
        let storage = Arc::new(FlakyStorage::new());
        let f = fixture_on(StaticProbe::offline(), storage.clone(), 100).await;
        let mut events = f.queue.subscribe();
        f.queue
            .queue_change(folder("f1", ChangeOperation::Update, json!({"name": "x"})))
            .await
            .unwrap();

        storage.fail_writes(true);
        f.remote.push(Scripted::Reject(422));
        go_online(&f.detector);
        assert!(f.queue.flush().await.is_err());

        assert_eq!(f.queue.len().await, 1);
        assert!(f.queue.dead_letters().await.is_empty());
        assert!(events.try_recv().is_err());
    }
}
