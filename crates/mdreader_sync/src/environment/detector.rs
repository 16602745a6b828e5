//! The environment detector.
//!
//! Sole owner of the current [`Environment`] snapshot and therefore the sole
//! source of truth for the replication policy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::probe::EnvironmentProbe;
use super::types::{Environment, NetworkStatus, Platform};
use crate::error::{Result, SyncError};
use crate::storage::StorageProvider;

/// Storage key of the installation-wide device id.
pub const DEVICE_ID_KEY: &str = "device-id";

/// Receiver of environment snapshots. Dropping it unsubscribes.
pub type EnvironmentSubscription = mpsc::UnboundedReceiver<Environment>;

struct DetectorState {
    current: Environment,
    initialized: bool,
    subscribers: Vec<mpsc::UnboundedSender<Environment>>,
}

/// Observes network, authentication, platform and device identity.
///
/// Every distinct snapshot is delivered to every live subscriber, in the
/// order the transitions were detected. Repeating the current snapshot is
/// a no-op.
pub struct EnvironmentDetector {
    probe: Arc<dyn EnvironmentProbe>,
    state: Mutex<DetectorState>,
}

impl EnvironmentDetector {
    /// Create a detector fed by `probe`. Call [`init`](Self::init) before use.
    pub fn new(probe: Arc<dyn EnvironmentProbe>) -> Self {
        Self {
            probe,
            state: Mutex::new(DetectorState {
                current: Environment::offline_guest(""),
                initialized: false,
                subscribers: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detect the platform, load or create the device id, probe the network
    /// and the signed-in user, and publish the first snapshot.
    pub async fn init(&self, storage: &dyn StorageProvider) -> Result<Environment> {
        let device_id = load_or_create_device_id(storage).await?;
        let network = self.probe.probe_network().await;
        let user_id = self.probe.current_user();

        let env = Environment {
            platform: Platform::current(),
            network,
            auth: if user_id.is_some() {
                super::AuthState::Authenticated
            } else {
                super::AuthState::Guest
            },
            user_id,
            device_id,
        };

        {
            let mut state = self.state();
            state.initialized = true;
        }
        self.apply(env.clone());

        log::info!(
            "[EnvironmentDetector] Initialized: {:?}/{:?}/{:?} device={}",
            env.platform,
            env.network,
            env.auth,
            env.device_id
        );
        Ok(env)
    }

    /// Whether [`init`](Self::init) has completed.
    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// Last published snapshot.
    pub fn get_environment(&self) -> Environment {
        self.state().current.clone()
    }

    /// Receive every subsequent distinct snapshot.
    pub fn subscribe(&self) -> EnvironmentSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }

    /// `network == Online && auth == Authenticated` on the current snapshot.
    pub fn should_use_cloud_sync(&self) -> bool {
        self.state().current.should_use_cloud_sync()
    }

    /// Storage key for `document_id` under the current identity.
    pub fn get_storage_key(&self, document_id: &str) -> String {
        self.state().current.storage_key(document_id)
    }

    /// Record a network transition.
    pub fn set_network(&self, network: NetworkStatus) -> bool {
        self.update(|env| env.with_network(network))
    }

    /// Record a login.
    pub fn on_login(&self, user_id: impl Into<String>) -> bool {
        let user_id = user_id.into();
        self.update(|env| env.authenticated(user_id))
    }

    /// Record a logout.
    pub fn on_logout(&self) -> bool {
        self.update(|env| env.guest())
    }

    /// Re-run the network probe and publish the result.
    pub async fn reprobe(&self) -> NetworkStatus {
        let network = self.probe.probe_network().await;
        self.set_network(network);
        network
    }

    /// Replace the snapshot. Returns `false` if it equals the current one.
    pub fn apply(&self, env: Environment) -> bool {
        self.update(|_| env)
    }

    /// Compute, replace and publish under one lock so concurrent transitions
    /// are delivered in the order they were applied.
    fn update(&self, f: impl FnOnce(&Environment) -> Environment) -> bool {
        let mut state = self.state();
        let next = f(&state.current);
        if next == state.current {
            return false;
        }

        log::debug!(
            "[EnvironmentDetector] {:?}/{:?} -> {:?}/{:?}",
            state.current.network,
            state.current.auth,
            next.network,
            next.auth
        );
        state.current = next.clone();
        state
            .subscribers
            .retain(|subscriber| subscriber.send(next.clone()).is_ok());
        true
    }
}

async fn load_or_create_device_id(storage: &dyn StorageProvider) -> Result<String> {
    if let Some(bytes) = storage.read(DEVICE_ID_KEY).await? {
        match String::from_utf8(bytes) {
            Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
            _ => log::warn!("[EnvironmentDetector] Stored device id is unreadable, regenerating"),
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    storage
        .write(DEVICE_ID_KEY, id.as_bytes())
        .await
        .map_err(|e| SyncError::Durability(format!("cannot persist device id: {}", e)))?;
    log::info!("[EnvironmentDetector] Created device id {}", id);
    Ok(id)
}
