//! Records, events and identifiers of the offline change queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

/// Prefix of locally minted identifiers awaiting a server id.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Kind of structural entity a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum EntityType {
    /// A folder in a workspace tree
    Folder,
    /// Document metadata (the body replicates through the CRDT)
    Document,
    /// Workspace metadata
    Workspace,
}

impl EntityType {
    /// Lowercase name used in ids, paths and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Folder => "folder",
            EntityType::Document => "document",
            EntityType::Workspace => "workspace",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutation a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum ChangeOperation {
    /// Create the entity
    Create,
    /// Update fields of the entity
    Update,
    /// Delete the entity
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        })
    }
}

/// Scheduling tier. Orders ready records only; never reorders one entity's records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum Priority {
    /// Replayed first
    High,
    /// Default tier
    #[default]
    Normal,
    /// Replayed last
    Low,
}

/// A mutation as submitted by a caller, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ChangeRequest {
    /// Kind of entity
    pub entity_type: EntityType,
    /// Entity id; a temporary id for entities not yet created remotely
    pub entity_id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Mutation
    pub operation: ChangeOperation,
    /// Request body sent to the remote authority
    #[ts(type = "unknown")]
    pub data: Value,
    /// Scheduling tier
    #[serde(default)]
    pub priority: Priority,
}

impl ChangeRequest {
    /// A normal-priority request.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        workspace_id: impl Into<String>,
        operation: ChangeOperation,
        data: Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            workspace_id: workspace_id.into(),
            operation,
            data,
            priority: Priority::Normal,
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the body mentions `id` anywhere.
    pub fn references(&self, id: &str) -> bool {
        value_references(&self.data, id)
    }

    /// Replace `old_id` with `new_id` as entity id and inside the body.
    /// Returns whether anything changed.
    pub fn rewrite_id(&mut self, old_id: &str, new_id: &str) -> bool {
        let mut changed = false;
        if self.entity_id == old_id {
            self.entity_id = new_id.to_string();
            changed = true;
        }
        if self.workspace_id == old_id {
            self.workspace_id = new_id.to_string();
            changed = true;
        }
        rewrite_value(&mut self.data, old_id, new_id) || changed
    }

    /// Every temporary id this request names: entity, workspace or body.
    pub fn temp_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for id in [&self.entity_id, &self.workspace_id] {
            if is_temp_id(id) && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        collect_temp_ids(&self.data, &mut ids);
        ids
    }
}

/// A sequenced record in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PendingChange {
    /// Queue-local sequence number giving creation order
    pub seq: u64,
    /// The mutation
    #[serde(flatten)]
    pub request: ChangeRequest,
    /// When the record was queued
    pub created_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempt_count: u32,
    /// Error of the last failed attempt
    pub last_error: Option<String>,
}

impl PendingChange {
    pub(crate) fn new(seq: u64, request: ChangeRequest) -> Self {
        Self {
            seq,
            request,
            created_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Entity id this record applies to.
    pub fn entity_id(&self) -> &str {
        &self.request.entity_id
    }

    /// Mutation this record carries.
    pub fn operation(&self) -> ChangeOperation {
        self.request.operation
    }
}

/// A record that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DeadLetter {
    /// The record as it was when it failed
    pub change: PendingChange,
    /// Why it was given up on
    pub reason: String,
    /// HTTP status of a rejection, if the remote answered
    pub status: Option<u16>,
    /// When it was dead-lettered
    pub failed_at: DateTime<Utc>,
}

/// A temporary id replaced by the server-assigned one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Reconciliation {
    /// Kind of entity
    pub entity_type: EntityType,
    /// Owning workspace
    pub workspace_id: String,
    /// The temporary id
    pub old_id: String,
    /// The server-assigned id
    pub new_id: String,
    /// The reconciled local record, when a mirror holds one
    #[ts(type = "unknown")]
    pub entity: Option<Value>,
}

impl Reconciliation {
    /// Event name the UI listens for, e.g. `folder-synced`.
    pub fn event_name(&self) -> &'static str {
        match self.entity_type {
            EntityType::Folder => "folder-synced",
            EntityType::Document => "document-synced",
            EntityType::Workspace => "workspace-synced",
        }
    }
}

/// Asynchronous outcome of queue replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[ts(export, export_to = "bindings/")]
pub enum QueueEvent {
    /// A temporary id was replaced everywhere
    Reconciled(Reconciliation),
    /// A record was acknowledged and removed
    Replayed {
        /// Sequence number of the record
        seq: u64,
        /// Kind of entity
        entity_type: EntityType,
        /// Id the record was sent with
        entity_id: String,
        /// Mutation
        operation: ChangeOperation,
    },
    /// A record was given up on
    DeadLettered(DeadLetter),
}

/// What [`queue_change`](super::OfflineChangeQueue::queue_change) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended with this sequence number
    Queued(u64),
    /// A delete of a never-created entity dropped its queued records
    Cancelled {
        /// Records removed
        removed: usize,
    },
}

/// Mint a temporary id, e.g. `temp-folder-5f0c…`.
pub fn temp_id(entity_type: EntityType) -> String {
    format!("{}{}-{}", TEMP_ID_PREFIX, entity_type, uuid::Uuid::new_v4())
}

/// Whether `id` was minted by [`temp_id`] (or follows its shape).
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn value_references(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Array(items) => items.iter().any(|v| value_references(v, id)),
        Value::Object(map) => map.values().any(|v| value_references(v, id)),
        _ => false,
    }
}

fn collect_temp_ids(value: &Value, ids: &mut Vec<String>) {
    match value {
        Value::String(s) if is_temp_id(s) && !ids.contains(s) => ids.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_temp_ids(v, ids)),
        Value::Object(map) => map.values().for_each(|v| collect_temp_ids(v, ids)),
        _ => {}
    }
}

fn rewrite_value(value: &mut Value, old_id: &str, new_id: &str) -> bool {
    match value {
        Value::String(s) if s == old_id => {
            *s = new_id.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, v| rewrite_value(v, old_id, new_id) || acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, v| rewrite_value(v, old_id, new_id) || acc),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_temp_ids() {
        let id = temp_id(EntityType::Folder);
        assert!(id.starts_with("temp-folder-"));
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("6f1d2c"));
    }

    #[test]
    fn test_priority_orders_high_first() {
        let mut tiers = vec![Priority::Low, Priority::High, Priority::Normal];
        tiers.sort();
        assert_eq!(tiers, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn test_rewrite_id_in_entity_and_payload() {
        let mut request = ChangeRequest::new(
            EntityType::Folder,
            "temp-folder-a",
            "ws",
            ChangeOperation::Update,
            json!({ "parent_id": "temp-folder-a", "tags": ["x", "temp-folder-a"], "name": "temp-folder-ab" }),
        );
        assert!(request.references("temp-folder-a"));
        assert!(request.rewrite_id("temp-folder-a", "srv-1"));

        assert_eq!(request.entity_id, "srv-1");
        assert_eq!(
            request.data,
            json!({ "parent_id": "srv-1", "tags": ["x", "srv-1"], "name": "temp-folder-ab" })
        );
        assert!(!request.references("temp-folder-a"));
        assert!(!request.rewrite_id("temp-folder-a", "srv-1"));
    }

    #[test]
    fn test_temp_ids_lists_each_once() {
        let request = ChangeRequest::new(
            EntityType::Folder,
            "temp-folder-a",
            "temp-workspace-w",
            ChangeOperation::Create,
            json!({ "parent_id": "temp-folder-p", "after": ["temp-folder-p", "srv-2"] }),
        );
        assert_eq!(
            request.temp_ids(),
            vec!["temp-folder-a", "temp-workspace-w", "temp-folder-p"]
        );
    }

    #[test]
    fn test_pending_change_json_is_flat() {
        let change = PendingChange::new(
            7,
            ChangeRequest::new(
                EntityType::Folder,
                "f1",
                "ws",
                ChangeOperation::Delete,
                Value::Null,
            )
            .with_priority(Priority::High),
        );
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["entity_type"], "folder");
        assert_eq!(json["operation"], "delete");
        assert_eq!(json["priority"], "high");

        let back: PendingChange = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_folder_synced_event_payload() {
        let event = Reconciliation {
            entity_type: EntityType::Folder,
            workspace_id: "ws".into(),
            old_id: "temp-folder-abc".into(),
            new_id: "srv-9".into(),
            entity: None,
        };
        assert_eq!(event.event_name(), "folder-synced");
        let json = serde_json::to_value(QueueEvent::Reconciled(event)).unwrap();
        assert_eq!(json["type"], "reconciled");
        assert_eq!(json["oldId"], "temp-folder-abc");
        assert_eq!(json["newId"], "srv-9");
    }
}
