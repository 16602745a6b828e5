//! Probes feeding the environment detector.

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
use std::time::Duration;

use super::types::NetworkStatus;
use crate::BoxFuture;

/// Source of the raw facts an [`Environment`](super::Environment) is built from.
pub trait EnvironmentProbe: Send + Sync {
    /// Check whether the remote authority is reachable.
    fn probe_network(&self) -> BoxFuture<'_, NetworkStatus>;

    /// User signed in when the session starts, if any.
    fn current_user(&self) -> Option<String>;
}

/// Probe with fixed answers.
///
/// Used for local-only sessions and in tests.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    network: NetworkStatus,
    user_id: Option<String>,
}

impl StaticProbe {
    /// Probe reporting `network` and `user_id`.
    pub fn new(network: NetworkStatus, user_id: Option<String>) -> Self {
        Self { network, user_id }
    }

    /// Offline guest.
    pub fn offline() -> Self {
        Self::new(NetworkStatus::Offline, None)
    }

    /// Online and signed in as `user_id`.
    pub fn online_as(user_id: impl Into<String>) -> Self {
        Self::new(NetworkStatus::Online, Some(user_id.into()))
    }
}

impl EnvironmentProbe for StaticProbe {
    fn probe_network(&self) -> BoxFuture<'_, NetworkStatus> {
        Box::pin(async move { self.network })
    }

    fn current_user(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Probe that tries a bounded TCP connect to the sync server host.
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
#[derive(Debug, Clone)]
pub struct TcpReachabilityProbe {
    address: Option<(String, u16)>,
    timeout: Duration,
    user_id: Option<String>,
}

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
impl TcpReachabilityProbe {
    /// Probe for the host of `server_url` (ws, wss, http or https).
    ///
    /// An unparseable URL yields a probe that always reports offline.
    pub fn new(server_url: &str, timeout: Duration, user_id: Option<String>) -> Self {
        let address = url::Url::parse(server_url).ok().and_then(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default()?;
            Some((host, port))
        });
        if address.is_none() {
            log::warn!(
                "[EnvironmentProbe] Cannot derive a host from {:?}, reporting offline",
                server_url
            );
        }
        Self {
            address,
            timeout,
            user_id,
        }
    }
}

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
impl EnvironmentProbe for TcpReachabilityProbe {
    fn probe_network(&self) -> BoxFuture<'_, NetworkStatus> {
        Box::pin(async move {
            let Some((host, port)) = &self.address else {
                return NetworkStatus::Offline;
            };
            let connect = tokio::net::TcpStream::connect((host.as_str(), *port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_)) => NetworkStatus::Online,
                Ok(Err(e)) => {
                    log::debug!("[EnvironmentProbe] {}:{} unreachable: {}", host, port, e);
                    NetworkStatus::Offline
                }
                Err(_) => {
                    log::debug!("[EnvironmentProbe] {}:{} timed out", host, port);
                    NetworkStatus::Offline
                }
            }
        })
    }

    fn current_user(&self) -> Option<String> {
        self.user_id.clone()
    }
}
