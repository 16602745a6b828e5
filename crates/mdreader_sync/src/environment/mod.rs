//! Environment detection.
//!
//! The [`EnvironmentDetector`] answers one question for the rest of the
//! engine: should data replicate right now? It does so from an immutable
//! [`Environment`] snapshot that it replaces whenever the network or the
//! signed-in user changes, and publishes each new snapshot to subscribers.

mod detector;
mod probe;
mod types;

pub use detector::{DEVICE_ID_KEY, EnvironmentDetector, EnvironmentSubscription};
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use probe::TcpReachabilityProbe;
pub use probe::{EnvironmentProbe, StaticProbe};
pub use types::{AuthState, Environment, NetworkStatus, Platform};
