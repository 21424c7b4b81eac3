//! Tunnel registry shared by the control loop and the stream forwarders

use reverso_proto::TunnelConfig;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Name → tunnel configuration, guarded by a single lock.
///
/// Entries are only added or overwritten, never removed.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, TunnelConfig>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge tunnel definitions, overwriting entries with the same name
    pub async fn merge(&self, tunnels: HashMap<String, TunnelConfig>) {
        let mut guard = self.tunnels.lock().await;
        guard.extend(tunnels);
    }

    pub async fn insert(&self, name: impl Into<String>, tunnel: TunnelConfig) {
        self.tunnels.lock().await.insert(name.into(), tunnel);
    }

    /// Copy of one entry as of now
    pub async fn get(&self, name: &str) -> Option<TunnelConfig> {
        self.tunnels.lock().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, TunnelConfig> {
        self.tunnels.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.lock().await.is_empty()
    }
}
