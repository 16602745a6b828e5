//! Environment snapshot types.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Runtime the engine is embedded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum Platform {
    /// Native desktop application
    Desktop,
    /// Browser (wasm32)
    Web,
}

impl Platform {
    /// Platform of the current build target.
    pub fn current() -> Self {
        if cfg!(target_arch = "wasm32") {
            Platform::Web
        } else {
            Platform::Desktop
        }
    }
}

/// Network reachability of the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum NetworkStatus {
    /// The sync server answered the last probe
    Online,
    /// The sync server could not be reached
    Offline,
}

/// Authentication state of the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum AuthState {
    /// No signed-in user; data stays on this device
    Guest,
    /// A user is signed in
    Authenticated,
}

/// Immutable snapshot of the runtime environment.
///
/// A new snapshot replaces the previous one as a whole; consumers never see
/// a half-updated environment. `user_id` is set exactly when `auth` is
/// [`AuthState::Authenticated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Environment {
    /// Embedding runtime
    pub platform: Platform,
    /// Reachability of the sync server
    pub network: NetworkStatus,
    /// Guest or signed in
    pub auth: AuthState,
    /// Signed-in user, if any
    pub user_id: Option<String>,
    /// Stable identifier of this installation
    pub device_id: String,
}

impl Environment {
    /// Offline guest snapshot, the state before any probe has run.
    pub fn offline_guest(device_id: impl Into<String>) -> Self {
        Self {
            platform: Platform::current(),
            network: NetworkStatus::Offline,
            auth: AuthState::Guest,
            user_id: None,
            device_id: device_id.into(),
        }
    }

    /// Copy of this snapshot with a different network status.
    pub fn with_network(&self, network: NetworkStatus) -> Self {
        Self {
            network,
            ..self.clone()
        }
    }

    /// Copy of this snapshot signed in as `user_id`.
    pub fn authenticated(&self, user_id: impl Into<String>) -> Self {
        Self {
            auth: AuthState::Authenticated,
            user_id: Some(user_id.into()),
            ..self.clone()
        }
    }

    /// Copy of this snapshot signed out.
    pub fn guest(&self) -> Self {
        Self {
            auth: AuthState::Guest,
            user_id: None,
            ..self.clone()
        }
    }

    /// Whether documents and structural changes should replicate.
    pub fn should_use_cloud_sync(&self) -> bool {
        self.network == NetworkStatus::Online && self.auth == AuthState::Authenticated
    }

    /// Namespaced storage key for a document.
    ///
    /// Guest and authenticated data for the same document id never collide.
    pub fn storage_key(&self, document_id: &str) -> String {
        match (&self.auth, &self.user_id) {
            (AuthState::Authenticated, Some(user_id)) => {
                format!("mdreader-user-{}-{}", user_id, document_id)
            }
            _ => format!("mdreader-guest-{}-{}", self.device_id, document_id),
        }
    }
}
