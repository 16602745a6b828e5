//! Durable queue state and its ordering rules.
//!
//! The state is small and written whole, as one record under `queue/state`:
//! the sequenced records, the next sequence number, the dead letters and the
//! temporary ids already replaced by server ids. A single record means a
//! crash never leaves a change both pending and dead-lettered, or neither.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{ChangeOperation, ChangeRequest, DeadLetter, PendingChange, is_temp_id};
use crate::error::Result;
use crate::storage::{StorageProvider, read_json, write_json};

/// Storage key of the queue.
pub const QUEUE_KEY: &str = "queue/state";

/// Reconciled temporary ids remembered for late writers.
const MAX_ALIASES: usize = 1024;

/// In-memory image of the persisted queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct QueueState {
    next_seq: u64,
    records: Vec<PendingChange>,
    #[serde(default)]
    dead: Vec<DeadLetter>,
    /// Temporary id to server id, oldest first
    #[serde(default)]
    aliases: VecDeque<(String, String)>,
}

impl QueueState {
    pub(crate) async fn load(storage: &dyn StorageProvider) -> Result<Self> {
        let mut state: Self = read_json(storage, QUEUE_KEY).await?.unwrap_or_default();

        state.records.sort_by_key(|r| r.seq);
        // Never hand out a sequence number that is already stored
        let floor = state.records.last().map_or(0, |r| r.seq + 1);
        state.next_seq = state.next_seq.max(floor);
        Ok(state)
    }

    pub(crate) async fn save(&self, storage: &dyn StorageProvider) -> Result<()> {
        write_json(storage, QUEUE_KEY, self).await
    }

    pub(crate) fn records(&self) -> &[PendingChange] {
        &self.records
    }

    pub(crate) fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead
    }

    pub(crate) fn get_mut(&mut self, seq: u64) -> Option<&mut PendingChange> {
        self.records.iter_mut().find(|r| r.seq == seq)
    }

    /// Append `request` and return its sequence number.
    pub(crate) fn push(&mut self, request: ChangeRequest) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push(PendingChange::new(seq, request));
        seq
    }

    /// Whether a create for `entity_id` is still queued (or being sent).
    pub(crate) fn has_queued_create(&self, entity_id: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.entity_id() == entity_id && r.operation() == ChangeOperation::Create)
    }

    pub(crate) fn has_pending_for(&self, entity_id: &str) -> bool {
        self.records.iter().any(|r| r.entity_id() == entity_id)
    }

    pub(crate) fn remove(&mut self, seq: u64) -> Option<PendingChange> {
        let index = self.records.iter().position(|r| r.seq == seq)?;
        Some(self.records.remove(index))
    }

    /// Remove every record of `entity_id`.
    pub(crate) fn remove_entity(&mut self, entity_id: &str) -> Vec<PendingChange> {
        let (removed, kept) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.entity_id() == entity_id);
        self.records = kept;
        removed
    }

    /// Replace `old_id` everywhere in the pending records and remember the
    /// mapping for records queued later. Returns how many records changed.
    pub(crate) fn reconcile(&mut self, old_id: &str, new_id: &str) -> usize {
        self.aliases.retain(|(old, _)| old != old_id);
        self.aliases
            .push_back((old_id.to_string(), new_id.to_string()));
        while self.aliases.len() > MAX_ALIASES {
            self.aliases.pop_front();
        }

        self.records
            .iter_mut()
            .filter_map(|r| r.request.rewrite_id(old_id, new_id).then_some(()))
            .count()
    }

    /// Server id a temporary id was reconciled to, if any.
    pub(crate) fn alias(&self, temp_id: &str) -> Option<&str> {
        self.aliases
            .iter()
            .find(|(old, _)| old == temp_id)
            .map(|(_, new)| new.as_str())
    }

    /// Rewrite every reconciled temporary id `request` names.
    pub(crate) fn resolve_aliases(&self, request: &mut ChangeRequest) {
        for temp in request.temp_ids() {
            if let Some(new_id) = self.alias(&temp) {
                request.rewrite_id(&temp, new_id);
            }
        }
    }

    /// A temporary id `request` depends on that has no queued create.
    /// A create does not depend on its own id.
    pub(crate) fn missing_create(&self, request: &ChangeRequest) -> Option<String> {
        request.temp_ids().into_iter().find(|id| {
            let own_create =
                request.operation == ChangeOperation::Create && *id == request.entity_id;
            !own_create && !self.has_queued_create(id)
        })
    }

    pub(crate) fn take_dead(&mut self, seq: u64) -> Option<DeadLetter> {
        let index = self.dead.iter().position(|d| d.change.seq == seq)?;
        Some(self.dead.remove(index))
    }

    /// Move a record to the dead-letter list. When it is a create, every
    /// later record of the same entity goes with it.
    pub(crate) fn dead_letter(
        &mut self,
        seq: u64,
        reason: &str,
        status: Option<u16>,
    ) -> Vec<DeadLetter> {
        let Some(change) = self.remove(seq) else {
            return Vec::new();
        };
        let mut failed = vec![change];
        if failed[0].operation() == ChangeOperation::Create {
            let entity_id = failed[0].entity_id().to_string();
            failed.extend(self.remove_entity(&entity_id));
        }

        let failed_at = Utc::now();
        let letters: Vec<DeadLetter> = failed
            .into_iter()
            .map(|change| {
                let cascaded = change.seq != seq;
                DeadLetter {
                    change,
                    reason: if cascaded {
                        format!("create #{} was rejected: {}", seq, reason)
                    } else {
                        reason.to_string()
                    },
                    status,
                    failed_at,
                }
            })
            .collect();
        self.dead.extend(letters.iter().cloned());
        letters
    }

    /// Dead-letter every record that depends on a temporary id whose create
    /// is gone, since nothing could ever replay them.
    pub(crate) fn dead_letter_orphans(&mut self) -> Vec<DeadLetter> {
        let orphans: Vec<(u64, String)> = self
            .records
            .iter()
            .filter_map(|r| self.missing_create(&r.request).map(|id| (r.seq, id)))
            .collect();

        let failed_at = Utc::now();
        let mut letters = Vec::with_capacity(orphans.len());
        for (seq, missing) in orphans {
            if let Some(change) = self.remove(seq) {
                letters.push(DeadLetter {
                    change,
                    reason: format!("{} was never created remotely", missing),
                    status: None,
                    failed_at,
                });
            }
        }
        self.dead.extend(letters.iter().cloned());
        letters
    }

    /// The next record to replay, if any is ready.
    ///
    /// Only the oldest record of each entity is a candidate, so one entity's
    /// records replay strictly in enqueue order. A candidate whose body
    /// references a temporary id with a queued create waits for that create.
    /// Among the rest, the highest priority tier wins, then the lowest seq.
    pub(crate) fn next_ready(&self) -> Option<&PendingChange> {
        let mut heads: HashMap<&str, &PendingChange> = HashMap::new();
        for record in &self.records {
            heads
                .entry(record.entity_id())
                .and_modify(|head| {
                    if record.seq < head.seq {
                        *head = record;
                    }
                })
                .or_insert(record);
        }

        let awaiting_create: HashSet<&str> = self
            .records
            .iter()
            .filter(|r| r.operation() == ChangeOperation::Create && is_temp_id(r.entity_id()))
            .map(|r| r.entity_id())
            .collect();

        heads
            .into_values()
            .filter(|head| {
                !awaiting_create.iter().any(|temp| {
                    *temp != head.entity_id()
                        && (head.request.references(temp) || head.request.workspace_id == *temp)
                })
            })
            .min_by_key(|head| (head.request.priority, head.seq))
    }
}
