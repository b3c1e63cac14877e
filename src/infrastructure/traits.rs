//! Statically-verified seams between components and the store (§9: replaces
//! runtime capability probing in the source with compile-time interfaces).

use crate::error::AppResult;
use crate::infrastructure::model::{
    AuditEntry, ChangeEvent, NodeIdentity, PartitionRecord, PeerRecord, RecoverySession, Session,
    VectorClock,
};
use async_trait::async_trait;

/// Persistence seam used by C1/C2/C5: the clock singleton, the outbound event
/// log, and per-peer watermarks all live behind this trait so components never
/// touch `sqlx` directly.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    async fn load_identity(&self) -> AppResult<Option<NodeIdentity>>;
    async fn save_identity(&self, identity: &NodeIdentity) -> AppResult<()>;

    async fn load_clock(&self, node_id: &str) -> AppResult<Option<(VectorClock, u64)>>;
    async fn save_clock(&self, node_id: &str, vc: &VectorClock, lamport: u64) -> AppResult<()>;

    async fn append_event(&self, event: &ChangeEvent) -> AppResult<()>;
    async fn events_since(
        &self,
        peer_node_id: &str,
        since_lamport: u64,
        max_batch: u32,
    ) -> AppResult<Vec<ChangeEvent>>;
    async fn mark_processed(&self, event_id: &str, receiver_node_id: &str) -> AppResult<()>;
    async fn is_quarantined(&self, event_id: &str) -> AppResult<bool>;
    async fn quarantine(&self, event_id: &str, reason: &str) -> AppResult<()>;

    /// Quarantines every non-quarantined event `node_id` itself authored at or
    /// after `since`, used by C6's authoritative partition-resolution
    /// strategies to truncate the losing side's conflicting local events.
    async fn quarantine_events_since(
        &self,
        node_id: &str,
        since: chrono::DateTime<chrono::Utc>,
        reason: &str,
    ) -> AppResult<u64>;

    /// Any locally-known event touching the same `(table_name, record_id)`, used by
    /// the Sync Engine to detect concurrency before applying an incoming event.
    async fn latest_event_for_record(
        &self,
        table_name: &str,
        record_id: &str,
    ) -> AppResult<Option<ChangeEvent>>;

    async fn record_conflict_resolution(
        &self,
        resolution: &crate::infrastructure::model::ConflictResolution,
    ) -> AppResult<()>;

    async fn prune_acked_events(&self, retention_days: i64) -> AppResult<u64>;

    /// Materializes an applied event's effect onto the business table it targets
    /// (§4.5 step 3d): insert-or-overwrite by `record_id` for CREATE/UPDATE, row
    /// delete for DELETE. Generic over arbitrary business schemas, the same way
    /// the snapshot protocol's segment application is.
    async fn apply_business_mutation(&self, event: &ChangeEvent) -> AppResult<()>;
}

/// Persistence seam for C3: sessions, rate-limit state and the audit log.
#[async_trait]
pub trait SecurityStore: Send + Sync {
    async fn save_session(&self, session: &Session) -> AppResult<()>;
    async fn load_session(&self, session_id: &str) -> AppResult<Option<Session>>;
    async fn revoke_session(&self, session_id: &str) -> AppResult<()>;
    async fn sweep_expired_sessions(&self) -> AppResult<u64>;
    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()>;
}

/// Persistence seam for C4: the peer inventory.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn upsert_peer(&self, peer: &PeerRecord) -> AppResult<()>;
    async fn list_peers(&self) -> AppResult<Vec<PeerRecord>>;
    async fn get_peer(&self, node_id: &str) -> AppResult<Option<PeerRecord>>;
}

/// Persistence seam for C6: partitions and recovery sessions.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn open_partition(&self, record: &PartitionRecord) -> AppResult<()>;
    async fn resolve_partition(&self, partition_id: &str) -> AppResult<()>;
    async fn list_open_partitions(&self) -> AppResult<Vec<PartitionRecord>>;

    async fn save_recovery_session(&self, session: &RecoverySession) -> AppResult<()>;
    async fn load_recovery_session(&self, session_id: &str) -> AppResult<Option<RecoverySession>>;
}

#[async_trait]
pub trait MetricsInterface: Send + Sync {
    async fn record_sync_cycle(&self, peer_node_id: &str, events_applied: u64, success: bool);
    async fn record_recovery(&self, success: bool, duration_ms: u64, failure_reason: Option<&str>);
}
