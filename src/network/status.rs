//! Connectivity snapshot and probe.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    /// Transport reported by the platform, e.g. `wifi`, `cellular`, `none`
    pub connection_type: String,
}

impl NetworkStatus {
    #[must_use]
    pub fn online(connection_type: impl Into<String>) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            connection_type: connection_type.into(),
        }
    }

    #[must_use]
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            connection_type: "none".to_string(),
        }
    }

    /// Connected to a network that actually reaches the internet.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::offline()
    }
}

/// A source of connectivity changes (the platform's network-state API).
pub trait ConnectivityProbe: Send + Sync {
    /// Receiver that always holds the latest status.
    fn watch(&self) -> watch::Receiver<NetworkStatus>;
}

/// Probe driven by explicit calls, for embedders that push platform events
/// themselves and for tests.
pub struct ManualProbe {
    tx: watch::Sender<NetworkStatus>,
}

impl ManualProbe {
    #[must_use]
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_replace(status);
    }

    pub fn set_online(&self, online: bool) {
        self.set(if online { NetworkStatus::online("wifi") } else { NetworkStatus::offline() });
    }

    #[must_use]
    pub fn current(&self) -> NetworkStatus {
        self.tx.borrow().clone()
    }
}

impl Default for ManualProbe {
    fn default() -> Self {
        Self::new(NetworkStatus::online("wifi"))
    }
}

impl ConnectivityProbe for ManualProbe {
    fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_online_requires_reachability() {
        assert!(NetworkStatus::online("wifi").is_online());
        assert!(!NetworkStatus::offline().is_online());

        let captive_portal = NetworkStatus {
            is_connected: true,
            is_internet_reachable: false,
            connection_type: "wifi".into(),
        };
        assert!(!captive_portal.is_online());
    }

    #[test]
    fn test_manual_probe_publishes() {
        let probe = ManualProbe::new(NetworkStatus::offline());
        let rx = probe.watch();

        probe.set_online(true);

        assert!(rx.borrow().is_online());
        assert!(probe.current().is_online());
    }
}
