//! Connectivity state.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// No connection.
    Offline,
    /// Unmetered connection.
    Wifi,
    /// Metered connection.
    Cellular,
}

impl NetworkStatus {
    /// Whether sync may use this connection.
    pub fn allows_sync(&self, wifi_only: bool) -> bool {
        match self {
            NetworkStatus::Offline => false,
            NetworkStatus::Wifi => true,
            NetworkStatus::Cellular => !wifi_only,
        }
    }
}

/// Publishes connectivity changes.
///
/// The platform layer calls [`set`](Self::set); the engine and scheduler
/// read and subscribe.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    /// Creates a monitor reporting `initial`.
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Reports a new status.
    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// The latest status.
    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Whether sync may run now.
    pub fn is_online(&self, wifi_only: bool) -> bool {
        self.status().allows_sync(wifi_only)
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Wifi)
    }
}
