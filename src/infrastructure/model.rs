//! Shared data model for the sync core (§3 of the spec): the types every
//! component reads or writes, independent of how they get to disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type NodeId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub compression: bool,
    pub encryption: bool,
    pub vector_clocks: bool,
    pub conflict_resolution: bool,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            compression: false,
            encryption: true,
            vector_clocks: true,
            conflict_resolution: true,
        }
    }
}

/// Process-wide identity, created once on first start and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub registration_key_hash: String,
    pub capabilities: NodeCapabilities,
    pub signing_public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NodeIdentity {
    pub fn new(node_name: String, host: String, port: u16, registration_key_hash: String) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            node_name,
            host,
            port,
            registration_key_hash,
            capabilities: NodeCapabilities::default(),
            signing_public_key: None,
            created_at: Utc::now(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Mapping from nodeId to a non-negative, monotonically increasing counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock(pub HashMap<NodeId, u64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Concurrent,
    Equal,
}

impl VectorClock {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.0.get(node_id).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, node_id: &str) -> u64 {
        let entry = self.0.entry(node_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Merges `other` into `self` entrywise-max. Never decreases any entry (property 1).
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, &value) in &other.0 {
            let entry = self.0.entry(node_id.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let mut keys: Vec<&NodeId> = self.0.keys().chain(other.0.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let a = self.get(key);
            let b = other.get(key);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "CREATE",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEventMetadata {
    pub timestamp: DateTime<Utc>,
    pub node_version: String,
    pub registration_key_hash: String,
}

/// The atomic unit of replication (§3). Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,
    pub source_node_id: NodeId,
    pub table_name: String,
    pub record_id: String,
    pub operation: ChangeOperation,
    pub change_data: serde_json::Value,
    pub before_data: Option<serde_json::Value>,
    pub vector_clock: VectorClock,
    pub lamport_clock: u64,
    pub checksum: String,
    pub priority: u8,
    pub metadata: ChangeEventMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
    Partitioned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub node_name: String,
    pub endpoint: String,
    pub capabilities: NodeCapabilities,
    pub last_seen: DateTime<Utc>,
    pub reachability: Reachability,
    /// Highest lamportClock this node has pulled from the peer so far.
    pub local_high_watermark: u64,
    /// The peer's own most recently announced lamportClock, carried on its
    /// announce frame. Unlike `local_high_watermark` this reflects the
    /// peer's actual progress rather than our pull cursor against it, so C6
    /// can tell real lag (`peer_reported_lamport > local_high_watermark`)
    /// apart from a peer that is simply idle.
    pub peer_reported_lamport: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub peer_node_id: NodeId,
    pub symmetric_key: Vec<u8>,
    pub established_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    AuthSuccess,
    AuthFailure,
    SessionEstablished,
    SessionRevoked,
    RateLimited,
    KeyRotated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub event_type: AuditEventType,
    pub source_node_id: Option<NodeId>,
    pub source_address: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    Merge,
    SourceWins,
    TargetWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub partition_id: String,
    pub peers: Vec<NodeId>,
    pub detected_at: DateTime<Utc>,
    pub strategy: PartitionStrategy,
    pub status: PartitionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPhase {
    Requested,
    Exporting,
    Transferring,
    Applying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    pub session_id: String,
    pub donor_node_id: NodeId,
    pub phase: RecoveryPhase,
    pub snapshot_filename: Option<String>,
    pub bytes_received: u64,
    pub bytes_total: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    LastWriterWins,
    DeleteWins,
    CreateCreate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub kind: ConflictKind,
    pub winner_event_id: String,
    pub loser_event_id: String,
    pub derived_record_id: Option<String>,
    pub resolved_at: DateTime<Utc>,
}
