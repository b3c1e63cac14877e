//! C4 — Peer Discovery. LAN announcement over UDP multicast or broadcast and
//! the peer inventory with liveness tracking (§4.4). Grounded on this
//! codebase's service registry: a shared `RwLock<HashMap<_, _>>` of known
//! peers, fed by one background task and swept for staleness by another.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, instrument, warn};

use crate::config::{DiscoveryConfig, DiscoveryTransport};
use crate::error::AppResult;
use crate::infrastructure::clock::{registration_key_hash, ClockIdentity};
use crate::infrastructure::model::{NodeCapabilities, NodeId, PeerRecord, Reachability};
use crate::infrastructure::traits::DiscoveryStore;

const DISCOVERY_MAGIC: &str = "SYNCD1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnnounceFrame {
    magic: String,
    node_id: NodeId,
    node_name: String,
    endpoint: String,
    capabilities: NodeCapabilities,
    timestamp: chrono::DateTime<chrono::Utc>,
    registration_key_hash: String,
    /// The announcer's own lamportClock at announce time (§4.6 sync-lag signal).
    current_lamport: u64,
}

/// Notifies the Sync Engine of a reachability transition so it can stop (or
/// resume) scheduling work toward a peer without polling (§4.4).
#[derive(Debug, Clone)]
pub struct ReachabilityChange {
    pub node_id: NodeId,
    pub reachability: Reachability,
}

pub struct PeerDiscovery {
    local_node_id: NodeId,
    local_node_name: String,
    local_endpoint: String,
    local_capabilities: NodeCapabilities,
    registration_key_hash: String,
    discovery_port: u16,
    config: DiscoveryConfig,
    store: Arc<dyn DiscoveryStore>,
    clock: Arc<ClockIdentity>,
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
    change_tx: watch::Sender<Option<ReachabilityChange>>,
}

impl PeerDiscovery {
    pub fn new(
        local_node_id: NodeId,
        local_node_name: String,
        local_endpoint: String,
        local_capabilities: NodeCapabilities,
        registration_key_hash: String,
        discovery_port: u16,
        config: DiscoveryConfig,
        store: Arc<dyn DiscoveryStore>,
        clock: Arc<ClockIdentity>,
    ) -> (Self, watch::Receiver<Option<ReachabilityChange>>) {
        let (change_tx, change_rx) = watch::channel(None);
        (
            Self {
                local_node_id,
                local_node_name,
                local_endpoint,
                local_capabilities,
                registration_key_hash,
                discovery_port,
                config,
                store,
                clock,
                peers: RwLock::new(HashMap::new()),
                change_tx,
            },
            change_rx,
        )
    }

    pub async fn known_peers(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer(&self, node_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(node_id).cloned()
    }

    /// Binds the discovery socket per the configured transport and spawns the
    /// announce and listen loops. Both directions share one socket, as the
    /// frame format is transport-agnostic (§4.4).
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let socket = self.bind_socket().await?;
        let socket = Arc::new(socket);

        let announcer = Arc::clone(self);
        let announce_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            announcer.run_announce_loop(announce_socket).await;
        });

        let listener = Arc::clone(self);
        let listen_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            listener.run_listen_loop(listen_socket).await;
        });

        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            sweeper.run_liveness_sweep().await;
        });

        Ok(())
    }

    async fn bind_socket(&self) -> AppResult<UdpSocket> {
        let port = self.discovery_port;
        let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            crate::error::AppError::Internal(format!("failed to bind discovery socket: {}", e))
        })?;
        socket.set_broadcast(true).map_err(|e| {
            crate::error::AppError::Internal(format!("failed to enable broadcast: {}", e))
        })?;

        if matches!(self.config.transport, DiscoveryTransport::Multicast) {
            let group: std::net::Ipv4Addr = self.config.multicast_group.parse().map_err(|e| {
                crate::error::AppError::ConfigurationError(format!(
                    "invalid multicast group {}: {}",
                    self.config.multicast_group, e
                ))
            })?;
            socket
                .join_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED)
                .map_err(|e| {
                    crate::error::AppError::Internal(format!(
                        "failed to join multicast group {}: {}",
                        group, e
                    ))
                })?;
        }

        Ok(socket)
    }

    fn destination(&self) -> String {
        match self.config.transport {
            DiscoveryTransport::Multicast => {
                format!("{}:{}", self.config.multicast_group, self.discovery_port)
            }
            DiscoveryTransport::Broadcast => format!("255.255.255.255:{}", self.discovery_port),
        }
    }

    #[instrument(skip(self, socket))]
    async fn run_announce_loop(&self, socket: Arc<UdpSocket>) {
        let destination = self.destination();
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.announce_interval_ms));
        loop {
            interval.tick().await;
            let (_, current_lamport) = self.clock.snapshot().await;
            let frame = AnnounceFrame {
                magic: DISCOVERY_MAGIC.to_string(),
                node_id: self.local_node_id.clone(),
                node_name: self.local_node_name.clone(),
                endpoint: self.local_endpoint.clone(),
                capabilities: self.local_capabilities.clone(),
                timestamp: chrono::Utc::now(),
                registration_key_hash: self.registration_key_hash.clone(),
                current_lamport,
            };
            match serde_json::to_vec(&frame) {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, &destination).await {
                        warn!("discovery announce send failed: {}", e);
                    }
                }
                Err(e) => warn!("failed to encode discovery announcement: {}", e),
            }
        }
    }

    #[instrument(skip(self, socket))]
    async fn run_listen_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("discovery recv failed: {}", e);
                    continue;
                }
            };
            if let Some(frame) = Self::decode_frame(&buf[..len]) {
                self.handle_frame(frame, source).await;
            }
        }
    }

    fn decode_frame(bytes: &[u8]) -> Option<AnnounceFrame> {
        let frame: AnnounceFrame = serde_json::from_slice(bytes).ok()?;
        if frame.magic != DISCOVERY_MAGIC {
            return None;
        }
        Some(frame)
    }

    async fn handle_frame(&self, frame: AnnounceFrame, source: SocketAddr) {
        if frame.node_id == self.local_node_id {
            return;
        }
        if frame.registration_key_hash != self.registration_key_hash {
            warn!(
                source = %source,
                node_id = %frame.node_id,
                "dropped discovery announcement with mismatched registration key hash"
            );
            return;
        }

        let peer = PeerRecord {
            node_id: frame.node_id.clone(),
            node_name: frame.node_name,
            endpoint: frame.endpoint,
            capabilities: frame.capabilities,
            last_seen: frame.timestamp,
            reachability: Reachability::Reachable,
            local_high_watermark: self
                .peers
                .read()
                .await
                .get(&frame.node_id)
                .map(|p| p.local_high_watermark)
                .unwrap_or(0),
            peer_reported_lamport: frame.current_lamport,
        };

        let became_reachable = {
            let mut peers = self.peers.write().await;
            let was_unreachable = peers
                .get(&frame.node_id)
                .map(|p| p.reachability != Reachability::Reachable)
                .unwrap_or(true);
            peers.insert(frame.node_id.clone(), peer.clone());
            was_unreachable
        };

        if let Err(e) = self.store.upsert_peer(&peer).await {
            warn!("failed to persist peer record for {}: {}", frame.node_id, e);
        }

        if became_reachable {
            let _ = self.change_tx.send(Some(ReachabilityChange {
                node_id: frame.node_id,
                reachability: Reachability::Reachable,
            }));
        }
        debug!(source = %source, "processed discovery announcement");
    }

    /// Every `announceInterval`, re-evaluates each peer's liveness against
    /// the two thresholds of §4.4: REACHABLE requires an announcement within
    /// `3 × announceInterval` (default 30s); a peer stale past that window
    /// but not yet past `unreachableThreshold` intervals (default 6, 60s)
    /// drops to UNKNOWN rather than staying falsely REACHABLE, and past the
    /// full threshold it transitions to UNREACHABLE and the Sync Engine is
    /// notified so it stops scheduling work toward it.
    #[instrument(skip(self))]
    async fn run_liveness_sweep(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.announce_interval_ms));
        let fresh_threshold = Duration::from_millis(self.config.announce_interval_ms * 3);
        let unreachable_threshold = Duration::from_millis(
            self.config.announce_interval_ms * self.config.unreachable_threshold as u64,
        );
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            let mut changed = Vec::new();
            {
                let mut peers = self.peers.write().await;
                for peer in peers.values_mut() {
                    let age = now.signed_duration_since(peer.last_seen).to_std().unwrap_or_default();
                    let next = if age > unreachable_threshold {
                        Some(Reachability::Unreachable)
                    } else if age > fresh_threshold {
                        Some(Reachability::Unknown)
                    } else {
                        None
                    };
                    let Some(next) = next else { continue };
                    let should_transition = peer.reachability == Reachability::Reachable
                        || (peer.reachability == Reachability::Unknown && next == Reachability::Unreachable);
                    if should_transition {
                        peer.reachability = next;
                        changed.push(peer.clone());
                    }
                }
            }
            for peer in changed {
                warn!(node_id = %peer.node_id, reachability = ?peer.reachability, "peer liveness transition");
                if let Err(e) = self.store.upsert_peer(&peer).await {
                    warn!("failed to persist peer reachability change: {}", e);
                }
                let _ = self.change_tx.send(Some(ReachabilityChange {
                    node_id: peer.node_id,
                    reachability: peer.reachability,
                }));
            }
        }
    }

    /// Records the highest lamportClock pulled from `node_id` so far, used by
    /// the Sync Engine's pull phase and by C6's sync-lag signal (§4.5 step 3e).
    pub async fn record_watermark(&self, node_id: &str, lamport: u64) -> AppResult<()> {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            if lamport > peer.local_high_watermark {
                peer.local_high_watermark = lamport;
                self.store.upsert_peer(peer).await?;
            }
        }
        Ok(())
    }

    /// Forces the next pull from `node_id` to start from scratch. Used by C6
    /// when an authoritative partition resolution truncates our own
    /// conflicting events and needs a full re-pull to repopulate them.
    pub async fn reset_watermark(&self, node_id: &str) -> AppResult<()> {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.local_high_watermark = 0;
            self.store.upsert_peer(peer).await?;
        }
        Ok(())
    }

    /// Used by C6 when it independently declares a partition against a peer
    /// that discovery still sees as reachable (consistency-mismatch case).
    pub async fn mark_partitioned(&self, node_id: &str) -> AppResult<()> {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.reachability = Reachability::Partitioned;
            self.store.upsert_peer(peer).await?;
            let _ = self.change_tx.send(Some(ReachabilityChange {
                node_id: node_id.to_string(),
                reachability: Reachability::Partitioned,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_frame_round_trips_through_json() {
        let frame = AnnounceFrame {
            magic: DISCOVERY_MAGIC.to_string(),
            node_id: "node-a".into(),
            node_name: "alpha".into(),
            endpoint: "127.0.0.1:8765".into(),
            capabilities: NodeCapabilities::default(),
            timestamp: chrono::Utc::now(),
            registration_key_hash: registration_key_hash("secret", "node-a"),
            current_lamport: 7,
        };
        let bytes = serde_json::to_vec(&frame).unwrap();
        let decoded = PeerDiscovery::decode_frame(&bytes).unwrap();
        assert_eq!(decoded.node_id, "node-a");
    }

    #[test]
    fn frame_with_wrong_magic_is_rejected() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "magic": "WRONG",
            "node_id": "node-a",
            "node_name": "alpha",
            "endpoint": "127.0.0.1:8765",
            "capabilities": NodeCapabilities::default(),
            "timestamp": chrono::Utc::now(),
            "registration_key_hash": "x",
            "current_lamport": 0,
        }))
        .unwrap();
        assert!(PeerDiscovery::decode_frame(&bytes).is_none());
    }
}
