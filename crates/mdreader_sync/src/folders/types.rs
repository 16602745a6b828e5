//! Folder records and request payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use ts_rs::TS;

use crate::error::{Result, SyncError};

/// Icon given to folders created without one.
pub const DEFAULT_FOLDER_ICON: &str = "📁";

const MAX_NAME_CHARS: usize = 100;
const MAX_ICON_CHARS: usize = 10;

/// A folder as mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CachedFolder {
    /// Server id, or a temporary id until the create is acknowledged
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Parent folder; `None` at the workspace root
    pub parent_id: Option<String>,
    /// Display name
    pub name: String,
    /// Emoji icon
    pub icon: Option<String>,
    /// Hex color, e.g. `#3b82f6`
    pub color: Option<String>,
    /// Order among siblings
    pub position: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Last time the remote confirmed this state
    pub last_synced: Option<DateTime<Utc>>,
    /// Local changes have not reached the remote yet
    pub pending_changes: bool,
}

/// Folder shape returned by the remote list and write endpoints.
#[derive(Debug, Deserialize)]
struct RemoteFolder {
    id: String,
    workspace_id: String,
    name: String,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    position: i64,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl CachedFolder {
    /// Build a synced entry from a remote folder object.
    pub fn from_remote(value: Value) -> Result<Self> {
        let remote: RemoteFolder = serde_json::from_value(value)?;
        Ok(Self {
            updated_at: remote.updated_at.unwrap_or(remote.created_at),
            id: remote.id,
            workspace_id: remote.workspace_id,
            parent_id: remote.parent_id,
            name: remote.name,
            icon: remote.icon,
            color: remote.color,
            position: remote.position,
            created_at: remote.created_at,
            last_synced: Some(Utc::now()),
            pending_changes: false,
        })
    }

    /// JSON form used in events.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Fields of a folder to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct NewFolder {
    /// Display name, 1 to 100 characters
    pub name: String,
    /// Emoji icon; defaults to a folder emoji
    pub icon: Option<String>,
    /// Hex color
    pub color: Option<String>,
    /// Parent folder
    pub parent_id: Option<String>,
    /// Order among siblings
    #[serde(default)]
    pub position: i64,
}

impl NewFolder {
    /// A root-level folder named `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style parent.
    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_style(self.icon.as_deref(), self.color.as_deref())?;
        if self.position < 0 {
            return Err(SyncError::InvalidOperation(
                "position must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn payload(&self) -> Value {
        json!({
            "name": self.name.trim(),
            "icon": self.icon.as_deref().unwrap_or(DEFAULT_FOLDER_ICON),
            "color": self.color,
            "parent_id": self.parent_id,
            "position": self.position,
        })
    }
}

/// Fields of a folder to change. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FolderUpdate {
    /// New name
    pub name: Option<String>,
    /// New icon
    pub icon: Option<String>,
    /// New color
    pub color: Option<String>,
}

impl FolderUpdate {
    /// Only rename.
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.name.is_none() && self.icon.is_none() && self.color.is_none()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        validate_style(self.icon.as_deref(), self.color.as_deref())
    }

    pub(crate) fn apply_to(&self, folder: &mut CachedFolder) {
        if let Some(name) = &self.name {
            folder.name = name.trim().to_string();
        }
        if let Some(icon) = &self.icon {
            folder.icon = Some(icon.clone());
        }
        if let Some(color) = &self.color {
            folder.color = Some(color.clone());
        }
    }

    pub(crate) fn payload(&self) -> Value {
        let mut body = Map::new();
        if let Some(name) = &self.name {
            body.insert("name".into(), Value::String(name.trim().to_string()));
        }
        if let Some(icon) = &self.icon {
            body.insert("icon".into(), Value::String(icon.clone()));
        }
        if let Some(color) = &self.color {
            body.insert("color".into(), Value::String(color.clone()));
        }
        Value::Object(body)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let chars = name.trim().chars().count();
    if chars == 0 || chars > MAX_NAME_CHARS {
        return Err(SyncError::InvalidOperation(format!(
            "folder name must be 1 to {} characters",
            MAX_NAME_CHARS
        )));
    }
    Ok(())
}

fn validate_style(icon: Option<&str>, color: Option<&str>) -> Result<()> {
    if icon.is_some_and(|icon| icon.chars().count() > MAX_ICON_CHARS) {
        return Err(SyncError::InvalidOperation(format!(
            "folder icon must be at most {} characters",
            MAX_ICON_CHARS
        )));
    }
    if let Some(color) = color {
        let hex = color.strip_prefix('#').unwrap_or("");
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SyncError::InvalidOperation(format!(
                "color must be a hex code like #3b82f6, got {:?}",
                color
            )));
        }
    }
    Ok(())
}
