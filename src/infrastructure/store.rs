//! Relational store layer (§6: persisted bookkeeping tables) and the
//! `ChangeStore`/`SecurityStore`/`DiscoveryStore`/`RecoveryStore` trait
//! implementations the rest of the sync core depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};

use crate::error::{AppError, AppResult};
use crate::infrastructure::model::{
    AuditEntry, AuditEventType, ChangeEvent, ChangeOperation, ConflictKind, ConflictResolution,
    NodeCapabilities, NodeIdentity, PartitionRecord, PartitionStatus, PartitionStrategy,
    PeerRecord, Reachability, RecoveryPhase, RecoverySession, Session, VectorClock,
};
use crate::infrastructure::snapshot::{apply_segment, TableSegment};
use crate::infrastructure::traits::{ChangeStore, DiscoveryStore, RecoveryStore, SecurityStore};

/// Column name assumed for the primary key of every business table under
/// replication (matches the convention `snapshot.rs`'s segments use).
const BUSINESS_PRIMARY_KEY_COLUMN: &str = "id";

pub struct SyncStore {
    pool: SqlitePool,
}

impl SyncStore {
    pub async fn new(database_url: &str) -> AppResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> AppResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_nodes (
                node_id TEXT PRIMARY KEY,
                node_name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                registration_key_hash TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                signing_public_key TEXT,
                last_seen INTEGER,
                reachability TEXT,
                local_high_watermark INTEGER NOT NULL DEFAULT 0,
                peer_reported_lamport INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                is_self INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_events (
                event_id TEXT PRIMARY KEY,
                source_node_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                change_data TEXT NOT NULL,
                before_data TEXT,
                vector_clock TEXT NOT NULL,
                lamport_clock INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                node_version TEXT NOT NULL,
                registration_key_hash TEXT NOT NULL,
                event_timestamp INTEGER NOT NULL,
                quarantined INTEGER NOT NULL DEFAULT 0,
                quarantine_reason TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_events_lamport ON sync_events(lamport_clock)",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_events_record ON sync_events(table_name, record_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_event_receipts (
                event_id TEXT NOT NULL,
                receiver_node_id TEXT NOT NULL,
                processed_at INTEGER NOT NULL,
                PRIMARY KEY (event_id, receiver_node_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_sessions (
                session_id TEXT PRIMARY KEY,
                peer_node_id TEXT NOT NULL,
                symmetric_key BLOB NOT NULL,
                established_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_configurations (
                node_id TEXT PRIMARY KEY,
                vector_clock TEXT NOT NULL,
                lamport_clock INTEGER NOT NULL,
                registration_key_hash TEXT,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conflict_resolutions (
                id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                winner_event_id TEXT NOT NULL,
                loser_event_id TEXT NOT NULL,
                derived_record_id TEXT,
                resolved_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS network_partitions (
                partition_id TEXT PRIMARY KEY,
                peers TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                status TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS recovery_sessions (
                session_id TEXT PRIMARY KEY,
                donor_node_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                snapshot_filename TEXT,
                bytes_received INTEGER NOT NULL DEFAULT 0,
                bytes_total INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metric_name TEXT NOT NULL,
                metric_value REAL NOT NULL,
                recorded_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_logs (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                source_node_id TEXT,
                source_address TEXT NOT NULL,
                detail TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now)
}

fn operation_from_str(s: &str) -> ChangeOperation {
    match s {
        "CREATE" => ChangeOperation::Create,
        "DELETE" => ChangeOperation::Delete,
        _ => ChangeOperation::Update,
    }
}

fn reachability_to_str(r: Reachability) -> &'static str {
    match r {
        Reachability::Unknown => "UNKNOWN",
        Reachability::Reachable => "REACHABLE",
        Reachability::Unreachable => "UNREACHABLE",
        Reachability::Partitioned => "PARTITIONED",
    }
}

fn reachability_from_str(s: &str) -> Reachability {
    match s {
        "REACHABLE" => Reachability::Reachable,
        "UNREACHABLE" => Reachability::Unreachable,
        "PARTITIONED" => Reachability::Partitioned,
        _ => Reachability::Unknown,
    }
}

#[async_trait]
impl ChangeStore for SyncStore {
    async fn load_identity(&self) -> AppResult<Option<NodeIdentity>> {
        let row = sqlx::query(
            "SELECT node_id, node_name, host, port, registration_key_hash, capabilities, \
             signing_public_key, created_at FROM sync_nodes WHERE is_self = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(match row {
            Some(row) => {
                let capabilities: NodeCapabilities =
                    serde_json::from_str(row.get::<String, _>("capabilities").as_str())?;
                Some(NodeIdentity {
                    node_id: row.get("node_id"),
                    node_name: row.get("node_name"),
                    host: row.get("host"),
                    port: row.get::<i64, _>("port") as u16,
                    registration_key_hash: row.get("registration_key_hash"),
                    capabilities,
                    signing_public_key: row.get("signing_public_key"),
                    created_at: from_ts(row.get("created_at")),
                })
            }
            None => None,
        })
    }

    async fn save_identity(&self, identity: &NodeIdentity) -> AppResult<()> {
        let capabilities = serde_json::to_string(&identity.capabilities)?;
        sqlx::query(
            "INSERT INTO sync_nodes \
             (node_id, node_name, host, port, registration_key_hash, capabilities, \
              signing_public_key, created_at, is_self) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1) \
             ON CONFLICT(node_id) DO UPDATE SET \
               node_name = excluded.node_name, host = excluded.host, port = excluded.port, \
               registration_key_hash = excluded.registration_key_hash, \
               capabilities = excluded.capabilities, \
               signing_public_key = excluded.signing_public_key",
        )
        .bind(&identity.node_id)
        .bind(&identity.node_name)
        .bind(&identity.host)
        .bind(identity.port as i64)
        .bind(&identity.registration_key_hash)
        .bind(capabilities)
        .bind(&identity.signing_public_key)
        .bind(to_ts(identity.created_at))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn load_clock(&self, node_id: &str) -> AppResult<Option<(VectorClock, u64)>> {
        let row = sqlx::query(
            "SELECT vector_clock, lamport_clock FROM sync_configurations WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(match row {
            Some(row) => {
                let vc: VectorClock = serde_json::from_str(row.get::<String, _>("vector_clock").as_str())?;
                let lamport: i64 = row.get("lamport_clock");
                Some((vc, lamport as u64))
            }
            None => None,
        })
    }

    async fn save_clock(&self, node_id: &str, vc: &VectorClock, lamport: u64) -> AppResult<()> {
        let vc_json = serde_json::to_string(vc)?;
        sqlx::query(
            "INSERT INTO sync_configurations (node_id, vector_clock, lamport_clock, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(node_id) DO UPDATE SET \
               vector_clock = excluded.vector_clock, lamport_clock = excluded.lamport_clock, \
               updated_at = excluded.updated_at",
        )
        .bind(node_id)
        .bind(vc_json)
        .bind(lamport as i64)
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    /// Idempotent on `event_id`: a remote event re-applied after redelivery is a
    /// silent no-op rather than a primary-key error (§8 property 5).
    async fn append_event(&self, event: &ChangeEvent) -> AppResult<()> {
        let change_data = serde_json::to_string(&event.change_data)?;
        let before_data = event
            .before_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let vc_json = serde_json::to_string(&event.vector_clock)?;

        sqlx::query(
            "INSERT OR IGNORE INTO sync_events \
             (event_id, source_node_id, table_name, record_id, operation, change_data, \
              before_data, vector_clock, lamport_clock, checksum, priority, node_version, \
              registration_key_hash, event_timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.source_node_id)
        .bind(&event.table_name)
        .bind(&event.record_id)
        .bind(event.operation.as_str())
        .bind(change_data)
        .bind(before_data)
        .bind(vc_json)
        .bind(event.lamport_clock as i64)
        .bind(&event.checksum)
        .bind(event.priority as i64)
        .bind(&event.metadata.node_version)
        .bind(&event.metadata.registration_key_hash)
        .bind(to_ts(event.metadata.timestamp))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn events_since(
        &self,
        peer_node_id: &str,
        since_lamport: u64,
        max_batch: u32,
    ) -> AppResult<Vec<ChangeEvent>> {
        let rows = sqlx::query(
            "SELECT e.event_id, e.source_node_id, e.table_name, e.record_id, e.operation, \
                    e.change_data, e.before_data, e.vector_clock, e.lamport_clock, e.checksum, \
                    e.priority, e.node_version, e.registration_key_hash, e.event_timestamp \
             FROM sync_events e \
             LEFT JOIN sync_event_receipts r \
               ON r.event_id = e.event_id AND r.receiver_node_id = ? \
             WHERE e.lamport_clock > ? AND e.quarantined = 0 AND r.event_id IS NULL \
             ORDER BY e.priority DESC, e.lamport_clock ASC \
             LIMIT ?",
        )
        .bind(peer_node_id)
        .bind(since_lamport as i64)
        .bind(max_batch as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let change_data: serde_json::Value =
                serde_json::from_str(row.get::<String, _>("change_data").as_str())?;
            let before_data: Option<String> = row.get("before_data");
            let before_data = before_data
                .map(|s| serde_json::from_str::<serde_json::Value>(&s))
                .transpose()?;
            let vector_clock: VectorClock =
                serde_json::from_str(row.get::<String, _>("vector_clock").as_str())?;

            events.push(ChangeEvent {
                event_id: row.get("event_id"),
                source_node_id: row.get("source_node_id"),
                table_name: row.get("table_name"),
                record_id: row.get("record_id"),
                operation: operation_from_str(row.get::<String, _>("operation").as_str()),
                change_data,
                before_data,
                vector_clock,
                lamport_clock: row.get::<i64, _>("lamport_clock") as u64,
                checksum: row.get("checksum"),
                priority: row.get::<i64, _>("priority") as u8,
                metadata: crate::infrastructure::model::ChangeEventMetadata {
                    timestamp: from_ts(row.get("event_timestamp")),
                    node_version: row.get("node_version"),
                    registration_key_hash: row.get("registration_key_hash"),
                },
            });
        }
        Ok(events)
    }

    async fn mark_processed(&self, event_id: &str, receiver_node_id: &str) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO sync_event_receipts (event_id, receiver_node_id, processed_at) \
             VALUES (?, ?, ?) ON CONFLICT(event_id, receiver_node_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(receiver_node_id)
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn is_quarantined(&self, event_id: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT quarantined FROM sync_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(row.map(|r| r.get::<i64, _>("quarantined") != 0).unwrap_or(false))
    }

    async fn quarantine(&self, event_id: &str, reason: &str) -> AppResult<()> {
        sqlx::query("UPDATE sync_events SET quarantined = 1, quarantine_reason = ? WHERE event_id = ?")
            .bind(reason)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn quarantine_events_since(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
        reason: &str,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_events SET quarantined = 1, quarantine_reason = ? \
             WHERE source_node_id = ? AND event_timestamp >= ? AND quarantined = 0",
        )
        .bind(reason)
        .bind(node_id)
        .bind(to_ts(since))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }

    async fn latest_event_for_record(
        &self,
        table_name: &str,
        record_id: &str,
    ) -> AppResult<Option<ChangeEvent>> {
        let row = sqlx::query(
            "SELECT event_id, source_node_id, table_name, record_id, operation, change_data, \
                    before_data, vector_clock, lamport_clock, checksum, priority, node_version, \
                    registration_key_hash, event_timestamp \
             FROM sync_events WHERE table_name = ? AND record_id = ? AND quarantined = 0 \
             ORDER BY lamport_clock DESC LIMIT 1",
        )
        .bind(table_name)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(match row {
            Some(row) => {
                let change_data: serde_json::Value =
                    serde_json::from_str(row.get::<String, _>("change_data").as_str())?;
                let before_data: Option<String> = row.get("before_data");
                let before_data = before_data
                    .map(|s| serde_json::from_str::<serde_json::Value>(&s))
                    .transpose()?;
                let vector_clock: VectorClock =
                    serde_json::from_str(row.get::<String, _>("vector_clock").as_str())?;
                Some(ChangeEvent {
                    event_id: row.get("event_id"),
                    source_node_id: row.get("source_node_id"),
                    table_name: row.get("table_name"),
                    record_id: row.get("record_id"),
                    operation: operation_from_str(row.get::<String, _>("operation").as_str()),
                    change_data,
                    before_data,
                    vector_clock,
                    lamport_clock: row.get::<i64, _>("lamport_clock") as u64,
                    checksum: row.get("checksum"),
                    priority: row.get::<i64, _>("priority") as u8,
                    metadata: crate::infrastructure::model::ChangeEventMetadata {
                        timestamp: from_ts(row.get("event_timestamp")),
                        node_version: row.get("node_version"),
                        registration_key_hash: row.get("registration_key_hash"),
                    },
                })
            }
            None => None,
        })
    }

    async fn record_conflict_resolution(&self, resolution: &ConflictResolution) -> AppResult<()> {
        let kind = match resolution.kind {
            ConflictKind::LastWriterWins => "LAST_WRITER_WINS",
            ConflictKind::DeleteWins => "DELETE_WINS",
            ConflictKind::CreateCreate => "CREATE_CREATE",
        };
        sqlx::query(
            "INSERT INTO conflict_resolutions \
             (id, table_name, record_id, kind, winner_event_id, loser_event_id, \
              derived_record_id, resolved_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&resolution.id)
        .bind(&resolution.table_name)
        .bind(&resolution.record_id)
        .bind(kind)
        .bind(&resolution.winner_event_id)
        .bind(&resolution.loser_event_id)
        .bind(&resolution.derived_record_id)
        .bind(to_ts(resolution.resolved_at))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn prune_acked_events(&self, retention_days: i64) -> AppResult<u64> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(retention_days));
        let peer_count: i64 = sqlx::query("SELECT COUNT(*) FROM sync_nodes WHERE is_self = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?
            .get(0);

        let result = sqlx::query(
            "DELETE FROM sync_events WHERE event_timestamp < ? \
             OR event_id IN ( \
               SELECT event_id FROM sync_event_receipts \
               GROUP BY event_id HAVING COUNT(DISTINCT receiver_node_id) >= ? \
             )",
        )
        .bind(cutoff)
        .bind(peer_count)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(result.rows_affected())
    }

    async fn apply_business_mutation(&self, event: &ChangeEvent) -> AppResult<()> {
        match event.operation {
            ChangeOperation::Delete => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?",
                    event.table_name, BUSINESS_PRIMARY_KEY_COLUMN
                );
                sqlx::query(&sql)
                    .bind(&event.record_id)
                    .execute(&self.pool)
                    .await
                    .map_err(AppError::from)?;
                Ok(())
            }
            ChangeOperation::Create | ChangeOperation::Update => {
                let mut row = event.change_data.as_object().cloned().ok_or_else(|| {
                    AppError::Validation(format!(
                        "change_data for {}/{} must serialize to an object",
                        event.table_name, event.record_id
                    ))
                })?;
                row.insert(
                    BUSINESS_PRIMARY_KEY_COLUMN.to_string(),
                    Value::String(event.record_id.clone()),
                );
                let segment = TableSegment {
                    table_name: event.table_name.clone(),
                    primary_key_column: BUSINESS_PRIMARY_KEY_COLUMN.to_string(),
                    rows: vec![row],
                };
                apply_segment(&self.pool, &segment).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SecurityStore for SyncStore {
    async fn save_session(&self, session: &Session) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO sync_sessions \
             (session_id, peer_node_id, symmetric_key, established_at, expires_at, last_used_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
               expires_at = excluded.expires_at, last_used_at = excluded.last_used_at",
        )
        .bind(&session.session_id)
        .bind(&session.peer_node_id)
        .bind(&session.symmetric_key)
        .bind(to_ts(session.established_at))
        .bind(to_ts(session.expires_at))
        .bind(to_ts(session.last_used_at))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT session_id, peer_node_id, symmetric_key, established_at, expires_at, last_used_at \
             FROM sync_sessions WHERE session_id = ? AND revoked = 0",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(row.map(|row| Session {
            session_id: row.get("session_id"),
            peer_node_id: row.get("peer_node_id"),
            symmetric_key: row.get("symmetric_key"),
            established_at: from_ts(row.get("established_at")),
            expires_at: from_ts(row.get("expires_at")),
            last_used_at: from_ts(row.get("last_used_at")),
        }))
    }

    async fn revoke_session(&self, session_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE sync_sessions SET revoked = 1 WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn sweep_expired_sessions(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM sync_sessions WHERE expires_at < ? OR revoked = 1")
            .bind(to_ts(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        let event_type = match entry.event_type {
            AuditEventType::AuthSuccess => "AUTH_SUCCESS",
            AuditEventType::AuthFailure => "AUTH_FAILURE",
            AuditEventType::SessionEstablished => "SESSION_ESTABLISHED",
            AuditEventType::SessionRevoked => "SESSION_REVOKED",
            AuditEventType::RateLimited => "RATE_LIMITED",
            AuditEventType::KeyRotated => "KEY_ROTATED",
        };
        sqlx::query(
            "INSERT INTO audit_logs (id, event_type, source_node_id, source_address, detail, occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(event_type)
        .bind(&entry.source_node_id)
        .bind(&entry.source_address)
        .bind(&entry.detail)
        .bind(to_ts(entry.timestamp))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }
}

#[async_trait]
impl DiscoveryStore for SyncStore {
    async fn upsert_peer(&self, peer: &PeerRecord) -> AppResult<()> {
        let capabilities = serde_json::to_string(&peer.capabilities)?;
        sqlx::query(
            "INSERT INTO sync_nodes \
             (node_id, node_name, host, port, registration_key_hash, capabilities, last_seen, \
              reachability, local_high_watermark, peer_reported_lamport, created_at, is_self) \
             VALUES (?, ?, ?, ?, '', ?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT(node_id) DO UPDATE SET \
               node_name = excluded.node_name, host = excluded.host, port = excluded.port, \
               capabilities = excluded.capabilities, last_seen = excluded.last_seen, \
               reachability = excluded.reachability, \
               local_high_watermark = excluded.local_high_watermark, \
               peer_reported_lamport = excluded.peer_reported_lamport",
        )
        .bind(&peer.node_id)
        .bind(&peer.node_name)
        .bind(peer.endpoint.split(':').next().unwrap_or_default())
        .bind(
            peer.endpoint
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<i64>().ok())
                .unwrap_or(0),
        )
        .bind(capabilities)
        .bind(to_ts(peer.last_seen))
        .bind(reachability_to_str(peer.reachability))
        .bind(peer.local_high_watermark as i64)
        .bind(peer.peer_reported_lamport as i64)
        .bind(to_ts(peer.last_seen))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn list_peers(&self) -> AppResult<Vec<PeerRecord>> {
        let rows = sqlx::query(
            "SELECT node_id, node_name, host, port, capabilities, last_seen, reachability, \
                    local_high_watermark, peer_reported_lamport FROM sync_nodes WHERE is_self = 0",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;

        let mut peers = Vec::with_capacity(rows.len());
        for row in rows {
            let capabilities: NodeCapabilities =
                serde_json::from_str(row.get::<String, _>("capabilities").as_str())?;
            peers.push(PeerRecord {
                node_id: row.get("node_id"),
                node_name: row.get("node_name"),
                endpoint: format!("{}:{}", row.get::<String, _>("host"), row.get::<i64, _>("port")),
                capabilities,
                last_seen: from_ts(row.get::<Option<i64>, _>("last_seen").unwrap_or(0)),
                reachability: reachability_from_str(
                    row.get::<Option<String>, _>("reachability")
                        .unwrap_or_default()
                        .as_str(),
                ),
                local_high_watermark: row.get::<i64, _>("local_high_watermark") as u64,
                peer_reported_lamport: row.get::<i64, _>("peer_reported_lamport") as u64,
            });
        }
        Ok(peers)
    }

    async fn get_peer(&self, node_id: &str) -> AppResult<Option<PeerRecord>> {
        Ok(self
            .list_peers()
            .await?
            .into_iter()
            .find(|p| p.node_id == node_id))
    }
}

#[async_trait]
impl RecoveryStore for SyncStore {
    async fn open_partition(&self, record: &PartitionRecord) -> AppResult<()> {
        let peers = serde_json::to_string(&record.peers)?;
        let strategy = match record.strategy {
            PartitionStrategy::Merge => "merge",
            PartitionStrategy::SourceWins => "source-wins",
            PartitionStrategy::TargetWins => "target-wins",
        };
        sqlx::query(
            "INSERT INTO network_partitions (partition_id, peers, detected_at, strategy, status) \
             VALUES (?, ?, ?, ?, 'open')",
        )
        .bind(&record.partition_id)
        .bind(peers)
        .bind(to_ts(record.detected_at))
        .bind(strategy)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn resolve_partition(&self, partition_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE network_partitions SET status = 'resolved' WHERE partition_id = ?")
            .bind(partition_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn list_open_partitions(&self) -> AppResult<Vec<PartitionRecord>> {
        let rows = sqlx::query(
            "SELECT partition_id, peers, detected_at, strategy, status \
             FROM network_partitions WHERE status = 'open'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let peers: Vec<String> = serde_json::from_str(row.get::<String, _>("peers").as_str())?;
            let strategy = match row.get::<String, _>("strategy").as_str() {
                "source-wins" => PartitionStrategy::SourceWins,
                "target-wins" => PartitionStrategy::TargetWins,
                _ => PartitionStrategy::Merge,
            };
            let status = match row.get::<String, _>("status").as_str() {
                "resolved" => PartitionStatus::Resolved,
                _ => PartitionStatus::Open,
            };
            out.push(PartitionRecord {
                partition_id: row.get("partition_id"),
                peers,
                detected_at: from_ts(row.get("detected_at")),
                strategy,
                status,
            });
        }
        Ok(out)
    }

    async fn save_recovery_session(&self, session: &RecoverySession) -> AppResult<()> {
        let phase = match session.phase {
            RecoveryPhase::Requested => "REQUESTED",
            RecoveryPhase::Exporting => "EXPORTING",
            RecoveryPhase::Transferring => "TRANSFERRING",
            RecoveryPhase::Applying => "APPLYING",
            RecoveryPhase::Complete => "COMPLETE",
            RecoveryPhase::Failed => "FAILED",
        };
        sqlx::query(
            "INSERT INTO recovery_sessions \
             (session_id, donor_node_id, phase, snapshot_filename, bytes_received, bytes_total, started_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
               phase = excluded.phase, snapshot_filename = excluded.snapshot_filename, \
               bytes_received = excluded.bytes_received, bytes_total = excluded.bytes_total",
        )
        .bind(&session.session_id)
        .bind(&session.donor_node_id)
        .bind(phase)
        .bind(&session.snapshot_filename)
        .bind(session.bytes_received as i64)
        .bind(session.bytes_total as i64)
        .bind(to_ts(session.started_at))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn load_recovery_session(&self, session_id: &str) -> AppResult<Option<RecoverySession>> {
        let row = sqlx::query(
            "SELECT session_id, donor_node_id, phase, snapshot_filename, bytes_received, \
                    bytes_total, started_at FROM recovery_sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(row.map(|row| {
            let phase = match row.get::<String, _>("phase").as_str() {
                "EXPORTING" => RecoveryPhase::Exporting,
                "TRANSFERRING" => RecoveryPhase::Transferring,
                "APPLYING" => RecoveryPhase::Applying,
                "COMPLETE" => RecoveryPhase::Complete,
                "FAILED" => RecoveryPhase::Failed,
                _ => RecoveryPhase::Requested,
            };
            RecoverySession {
                session_id: row.get("session_id"),
                donor_node_id: row.get("donor_node_id"),
                phase,
                snapshot_filename: row.get("snapshot_filename"),
                bytes_received: row.get::<i64, _>("bytes_received") as u64,
                bytes_total: row.get::<i64, _>("bytes_total") as u64,
                started_at: from_ts(row.get("started_at")),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::model::NodeIdentity;

    async fn test_store() -> SyncStore {
        let store = SyncStore::new("sqlite::memory:").await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn identity_round_trips() {
        let store = test_store().await;
        let identity = NodeIdentity::new("node-a".into(), "127.0.0.1".into(), 8765, "hash".into());
        store.save_identity(&identity).await.unwrap();
        let loaded = store.load_identity().await.unwrap().unwrap();
        assert_eq!(loaded.node_id, identity.node_id);
        assert_eq!(loaded.node_name, "node-a");
    }

    #[tokio::test]
    async fn clock_round_trips() {
        let store = test_store().await;
        let mut vc = VectorClock::new();
        vc.increment("node-a");
        store.save_clock("node-a", &vc, 5).await.unwrap();
        let (loaded_vc, loaded_lamport) = store.load_clock("node-a").await.unwrap().unwrap();
        assert_eq!(loaded_vc.get("node-a"), 1);
        assert_eq!(loaded_lamport, 5);
    }

    #[tokio::test]
    async fn events_since_excludes_already_processed() {
        let store = test_store().await;
        let event = ChangeEvent {
            event_id: "e1".into(),
            source_node_id: "node-a".into(),
            table_name: "widgets".into(),
            record_id: "r1".into(),
            operation: ChangeOperation::Create,
            change_data: serde_json::json!({"name": "alpha"}),
            before_data: None,
            vector_clock: VectorClock::new(),
            lamport_clock: 1,
            checksum: "abc".into(),
            priority: 5,
            metadata: crate::infrastructure::model::ChangeEventMetadata {
                timestamp: Utc::now(),
                node_version: "0.1.0".into(),
                registration_key_hash: "hash".into(),
            },
        };
        store.append_event(&event).await.unwrap();

        let batch = store.events_since("node-b", 0, 100).await.unwrap();
        assert_eq!(batch.len(), 1);

        store.mark_processed("e1", "node-b").await.unwrap();
        let batch = store.events_since("node-b", 0, 100).await.unwrap();
        assert!(batch.is_empty());
    }

    fn widget_event(record_id: &str, operation: ChangeOperation, change_data: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            event_id: format!("evt-{}", record_id),
            source_node_id: "node-a".into(),
            table_name: "widgets".into(),
            record_id: record_id.into(),
            operation,
            change_data,
            before_data: None,
            vector_clock: VectorClock::new(),
            lamport_clock: 1,
            checksum: "abc".into(),
            priority: 5,
            metadata: crate::infrastructure::model::ChangeEventMetadata {
                timestamp: Utc::now(),
                node_version: "0.1.0".into(),
                registration_key_hash: "hash".into(),
            },
        }
    }

    #[tokio::test]
    async fn apply_business_mutation_upserts_then_deletes_by_record_id() {
        let store = test_store().await;
        sqlx::query("CREATE TABLE widgets (id TEXT PRIMARY KEY, name TEXT)")
            .execute(&store.pool)
            .await
            .unwrap();

        let create = widget_event("r1", ChangeOperation::Create, serde_json::json!({"name": "alpha"}));
        store.apply_business_mutation(&create).await.unwrap();

        let name: String = sqlx::query("SELECT name FROM widgets WHERE id = 'r1'")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("name");
        assert_eq!(name, "alpha");

        let update = widget_event("r1", ChangeOperation::Update, serde_json::json!({"name": "beta"}));
        store.apply_business_mutation(&update).await.unwrap();
        let name: String = sqlx::query("SELECT name FROM widgets WHERE id = 'r1'")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("name");
        assert_eq!(name, "beta", "update should overwrite the existing row");

        let delete = widget_event("r1", ChangeOperation::Delete, serde_json::Value::Null);
        store.apply_business_mutation(&delete).await.unwrap();
        let remaining: i64 = sqlx::query("SELECT COUNT(*) FROM widgets WHERE id = 'r1'")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn append_event_ignores_a_redelivered_event_id() {
        let store = test_store().await;
        let event = widget_event("r1", ChangeOperation::Create, serde_json::json!({"name": "alpha"}));
        store.append_event(&event).await.unwrap();
        // Redelivery of the exact same event must not error.
        store.append_event(&event).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) FROM sync_events WHERE event_id = ?")
            .bind(&event.event_id)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(count, 1);
    }
}
