use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use tokio::sync::RwLock;

use crate::core::models::{Peer, PeerView};

/// Peers go offline when the last accepted datagram is older than this.
pub const ONLINE_THRESHOLD_MS: i64 = 7000;

/// Device-id keyed peer map. Single writer (the discovery listener), many
/// readers. Entries are never removed implicitly; callers may prune.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<HashMap<String, Peer>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Datagrams can arrive out of order, so a
    /// stale one may still update name and endpoint, but last-seen never
    /// moves backward.
    pub async fn upsert(&self, mut peer: Peer) -> PeerView {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.get(&peer.device_id) {
            peer.last_seen_ms = peer.last_seen_ms.max(existing.last_seen_ms);
        }
        let view = to_view(&peer, peer.last_seen_ms);
        guard.insert(peer.device_id.clone(), peer);
        view
    }

    pub async fn snapshot(&self) -> Vec<PeerView> {
        let now_ms = Utc::now().timestamp_millis();
        let guard = self.inner.read().await;
        let mut views = guard.values().map(|peer| to_view(peer, now_ms)).collect::<Vec<_>>();
        views.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        views
    }

    pub async fn get(&self, device_id: &str) -> Option<Peer> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Explicit prune for the UI layer; the core never calls this.
    pub async fn remove(&self, device_id: &str) -> bool {
        self.inner.write().await.remove(device_id).is_some()
    }
}

fn to_view(peer: &Peer, now_ms: i64) -> PeerView {
    let last_seen_utc = Utc
        .timestamp_millis_opt(peer.last_seen_ms)
        .single()
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();
    PeerView {
        device_id: peer.device_id.clone(),
        device_name: peer.device_name.clone(),
        address: peer.address.clone(),
        tcp_port: peer.tcp_port,
        discovery_port: peer.discovery_port,
        last_seen_utc,
        online: now_ms - peer.last_seen_ms <= ONLINE_THRESHOLD_MS,
    }
}
