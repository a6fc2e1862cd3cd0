//! Runtime peer registry: connected/disconnected status for known trusted
//! devices, for a `serve` loop to report on. Generalizes the teacher's
//! `PeerRegistry` (seeded from a trust store, flipped online/offline by
//! connection events) from its fixed `peer_id`/`display_name` shape to the
//! richer [`TrustedDevice`] record.

use crate::trust::TrustedDevice;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub device: TrustedDevice,
    pub status: PeerStatus,
}

/// Thread-safe runtime view of trusted devices and their connectivity.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds/refreshes an entry from the trust manager's current device
    /// record, preserving its existing online/offline status.
    pub async fn upsert_trusted(&self, device: TrustedDevice) {
        let mut map = self.peers.write().await;
        let status = map.get(&device.device_id).map(|e| e.status).unwrap_or(PeerStatus::Offline);
        map.insert(device.device_id.clone(), PeerEntry { device, status });
    }

    pub async fn remove(&self, device_id: &str) {
        self.peers.write().await.remove(device_id);
    }

    pub async fn set_online(&self, device_id: &str) {
        let mut map = self.peers.write().await;
        if let Some(entry) = map.get_mut(device_id) {
            entry.status = PeerStatus::Online;
        }
    }

    pub async fn set_offline(&self, device_id: &str) {
        let mut map = self.peers.write().await;
        if let Some(entry) = map.get_mut(device_id) {
            entry.status = PeerStatus::Offline;
        }
    }

    pub async fn list_online(&self) -> Vec<PeerEntry> {
        self.peers.read().await.values().filter(|e| e.status == PeerStatus::Online).cloned().collect()
    }

    pub async fn list_all(&self) -> Vec<PeerEntry> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn get(&self, device_id: &str) -> Option<PeerEntry> {
        self.peers.read().await.get(device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> TrustedDevice {
        TrustedDevice { device_id: id.into(), device_name: "dev".into(), public_key: vec![1], multiaddrs: vec![], created_at: 0, last_seen: None }
    }

    #[tokio::test]
    async fn upsert_then_connectivity_transitions() {
        let registry = PeerRegistry::new();
        registry.upsert_trusted(device("p1")).await;
        registry.upsert_trusted(device("p2")).await;

        assert_eq!(registry.list_all().await.len(), 2);
        assert_eq!(registry.list_online().await.len(), 0);

        registry.set_online("p1").await;
        assert_eq!(registry.list_online().await.len(), 1);
        assert_eq!(registry.get("p1").await.unwrap().status, PeerStatus::Online);

        registry.set_offline("p1").await;
        assert_eq!(registry.list_online().await.len(), 0);
    }

    #[tokio::test]
    async fn upsert_preserves_online_status_on_refresh() {
        let registry = PeerRegistry::new();
        registry.upsert_trusted(device("p1")).await;
        registry.set_online("p1").await;

        let mut refreshed = device("p1");
        refreshed.device_name = "renamed".into();
        registry.upsert_trusted(refreshed).await;

        let entry = registry.get("p1").await.unwrap();
        assert_eq!(entry.status, PeerStatus::Online);
        assert_eq!(entry.device.device_name, "renamed");
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let registry = PeerRegistry::new();
        registry.upsert_trusted(device("p1")).await;
        registry.remove("p1").await;
        assert!(registry.get("p1").await.is_none());
    }
}
