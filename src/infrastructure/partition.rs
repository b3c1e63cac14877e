//! C6 — Partition Detector & Recovery. Computes per-peer divergence signals,
//! opens/resolves `PartitionRecord`s, and drives the bulk snapshot protocol
//! for new or long-absent peers (§4.6). Grounded on this codebase's eventual
//! consistency manager: a background worker on a fixed cadence, a stats
//! struct exposed to operators, and a retry/compensation loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::{RecoveryConfig, SyncConfig};
use crate::error::AppResult;
use crate::infrastructure::change_tracker::ChangeTracker;
use crate::infrastructure::clock::ClockIdentity;
use crate::infrastructure::discovery::{PeerDiscovery, ReachabilityChange};
use crate::infrastructure::model::{
    NodeId, PartitionRecord, PartitionStatus, PartitionStrategy, PeerRecord, Reachability,
    RecoveryPhase, RecoverySession,
};
use crate::infrastructure::snapshot::{self, SnapshotHeader, TableSegment};
use crate::infrastructure::traits::{ChangeStore, RecoveryStore};
use sqlx::sqlite::SqlitePool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub failure_reasons: HashMap<String, u64>,
}

impl RecoveryMetrics {
    pub fn average_duration_ms(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.total_duration_ms / self.total
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

pub struct PartitionDetector {
    node_id: NodeId,
    store: Arc<dyn RecoveryStore>,
    change_store: Arc<dyn ChangeStore>,
    discovery: Arc<PeerDiscovery>,
    clock: Arc<ClockIdentity>,
    change_tracker: Arc<ChangeTracker>,
    sync_config: SyncConfig,
    config: RecoveryConfig,
    mismatch_streaks: RwLock<HashMap<NodeId, u32>>,
    metrics: RwLock<RecoveryMetrics>,
}

impl PartitionDetector {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn RecoveryStore>,
        change_store: Arc<dyn ChangeStore>,
        discovery: Arc<PeerDiscovery>,
        clock: Arc<ClockIdentity>,
        change_tracker: Arc<ChangeTracker>,
        sync_config: SyncConfig,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            node_id,
            store,
            change_store,
            discovery,
            clock,
            change_tracker,
            sync_config,
            config,
            mismatch_streaks: RwLock::new(HashMap::new()),
            metrics: RwLock::new(RecoveryMetrics::default()),
        }
    }

    pub async fn metrics(&self) -> RecoveryMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn open_partitions(&self) -> AppResult<Vec<PartitionRecord>> {
        self.store.list_open_partitions().await
    }

    /// Reacts to reachability transitions pushed by C4: a peer going
    /// UNREACHABLE opens a partition immediately (§4.6 signal a).
    pub async fn run_reachability_watcher(self: Arc<Self>, mut change_rx: watch::Receiver<Option<ReachabilityChange>>) {
        loop {
            if change_rx.changed().await.is_err() {
                break;
            }
            let Some(change) = change_rx.borrow_and_update().clone() else {
                continue;
            };
            if change.reachability == Reachability::Unreachable {
                if let Err(e) = self.open_partition(&change.node_id, PartitionStrategy::Merge).await {
                    warn!("failed to open partition record for {}: {}", change.node_id, e);
                }
            } else if change.reachability == Reachability::Reachable {
                let open = match self.store.list_open_partitions().await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("failed to list open partitions for {}: {}", change.node_id, e);
                        continue;
                    }
                };
                for record in open.into_iter().filter(|r| r.peers.iter().any(|p| p == &change.node_id)) {
                    if let Err(e) = self.resolve_partition(&record).await {
                        warn!("failed to resolve partition {} for {}: {}", record.partition_id, change.node_id, e);
                    }
                }
            }
        }
    }

    /// Periodic consistency-mismatch sweep (§4.6 signal c). Compares a
    /// checksum digest over each known peer's recently-seen event window;
    /// `N` consecutive mismatches escalate to a declared partition.
    pub async fn run_consistency_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.sync_config.interval_ms));
        loop {
            interval.tick().await;
            let peers = self.discovery.known_peers().await;
            for peer in peers {
                if let Err(e) = self.check_consistency(&peer).await {
                    warn!("consistency check against {} failed: {}", peer.node_id, e);
                }
            }
        }
    }

    async fn check_consistency(&self, peer: &PeerRecord) -> AppResult<()> {
        // A full Merkle-style exchange requires a live connection to the peer,
        // driven by the Sync Engine; here we track the locally-observable half
        // of the signal: the peer's own announced lamportClock against our
        // pull cursor for it. `local_high_watermark` only ever increases as we
        // pull, so comparing it to the peer's live self-report (rather than to
        // a static zero) keeps the signal meaningful after the first sync.
        let behind = peer.peer_reported_lamport > peer.local_high_watermark;
        let mut streaks = self.mismatch_streaks.write().await;
        let streak = streaks.entry(peer.node_id.clone()).or_insert(0);
        if behind && peer.reachability == Reachability::Reachable {
            *streak += 1;
        } else {
            *streak = 0;
        }
        if *streak >= self.config.consistency_check_cycles {
            drop(streaks);
            self.open_partition(&peer.node_id, PartitionStrategy::Merge).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn open_partition(&self, peer_node_id: &str, strategy: PartitionStrategy) -> AppResult<()> {
        let record = PartitionRecord {
            partition_id: Uuid::new_v4().to_string(),
            peers: vec![self.node_id.clone(), peer_node_id.to_string()],
            detected_at: chrono::Utc::now(),
            strategy,
            status: PartitionStatus::Open,
        };
        self.store.open_partition(&record).await?;
        if let Err(e) = self.discovery.mark_partitioned(peer_node_id).await {
            warn!("failed to mark {} partitioned in discovery: {}", peer_node_id, e);
        }
        Ok(())
    }

    /// Applies the configured recovery strategy once both sides are
    /// reachable again (§4.6). `merge` is a no-op: the Sync Engine's
    /// conflict resolver already handles divergence on the next cycle.
    /// `source-wins`/`target-wins` truncate the losing side's conflicting
    /// local events (quarantining everything we authored since the
    /// partition was detected, so it drops out of future pulls/pushes and
    /// out of `latest_event_for_record`) and force a full re-pull by
    /// resetting our watermark for the winning peer back to zero.
    #[instrument(skip(self))]
    pub async fn resolve_partition(&self, partition: &PartitionRecord) -> AppResult<()> {
        let losing_node_id = match partition.strategy {
            PartitionStrategy::Merge => None,
            PartitionStrategy::SourceWins => partition.peers.iter().find(|p| *p != &self.node_id),
            PartitionStrategy::TargetWins => partition.peers.iter().find(|p| *p == &self.node_id),
        };

        if let Some(loser) = losing_node_id {
            if loser == &self.node_id {
                let truncated = self
                    .change_store
                    .quarantine_events_since(
                        &self.node_id,
                        partition.detected_at,
                        &format!("truncated by partition {} resolution", partition.partition_id),
                    )
                    .await?;
                let winner = partition.peers.iter().find(|p| *p != &self.node_id);
                if let Some(winner) = winner {
                    self.discovery.reset_watermark(winner).await?;
                }
                warn!(
                    partition_id = %partition.partition_id,
                    truncated,
                    "our local events lost the partition resolution; truncated and forcing a full re-pull"
                );
            } else {
                warn!(
                    partition_id = %partition.partition_id,
                    loser = %loser,
                    "peer's local events lost the partition resolution; nothing to truncate locally"
                );
            }
        }

        self.store.resolve_partition(&partition.partition_id).await
    }

    /// Donor side of the bulk snapshot protocol (§4.6 steps 2-3). Disables
    /// local capture transiently so the export is a consistent point-in-time
    /// view, then re-enables it once the dump completes.
    #[instrument(skip(self, pool, tables))]
    pub async fn export_snapshot(
        &self,
        pool: &SqlitePool,
        tables: &[(&str, &str)],
    ) -> AppResult<(String, u64, HashMap<NodeId, u64>)> {
        self.change_tracker.disable();
        let result = self.export_snapshot_inner(pool, tables).await;
        self.change_tracker.enable();
        result
    }

    async fn export_snapshot_inner(
        &self,
        pool: &SqlitePool,
        tables: &[(&str, &str)],
    ) -> AppResult<(String, u64, HashMap<NodeId, u64>)> {
        let segments: Vec<TableSegment> = snapshot::export_segments(pool, tables).await?;
        let (clock, _) = self.clock.snapshot().await;
        let clock_manifest = clock.0.clone();
        let header = SnapshotHeader {
            donor_node_id: self.node_id.clone(),
            created_at: chrono::Utc::now(),
            clock_manifest: clock.0,
        };
        let filename = format!("snapshot-{}.bin", Uuid::new_v4());
        let (_, bytes) = snapshot::write_snapshot_file(
            &self.sync_config.data_dir_subpath("backups"),
            &filename,
            header,
            segments,
        )?;
        Ok((filename, bytes, clock_manifest))
    }

    /// Joiner side: applies a fetched snapshot and fast-forwards the vector
    /// clock to the manifest's maximum per-node values (§4.6 step 4-5).
    #[instrument(skip(self, pool))]
    pub async fn apply_snapshot(
        &self,
        pool: &SqlitePool,
        donor_node_id: &str,
        path: &std::path::Path,
    ) -> AppResult<u64> {
        let started = std::time::Instant::now();
        let mut session = RecoverySession {
            session_id: Uuid::new_v4().to_string(),
            donor_node_id: donor_node_id.to_string(),
            phase: RecoveryPhase::Applying,
            snapshot_filename: path.file_name().map(|n| n.to_string_lossy().to_string()),
            bytes_received: 0,
            bytes_total: 0,
            started_at: chrono::Utc::now(),
        };
        self.store.save_recovery_session(&session).await?;

        let outcome = self.apply_snapshot_inner(pool, path, &mut session).await;
        let mut metrics = self.metrics.write().await;
        metrics.total += 1;
        metrics.total_duration_ms += started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => {
                session.phase = RecoveryPhase::Complete;
                metrics.successful += 1;
            }
            Err(e) => {
                session.phase = RecoveryPhase::Failed;
                metrics.failed += 1;
                *metrics.failure_reasons.entry(e.to_string()).or_insert(0) += 1;
            }
        }
        drop(metrics);
        self.store.save_recovery_session(&session).await?;
        outcome
    }

    async fn apply_snapshot_inner(
        &self,
        pool: &SqlitePool,
        path: &std::path::Path,
        session: &mut RecoverySession,
    ) -> AppResult<u64> {
        let file = snapshot::read_snapshot_file(path)?;
        session.bytes_total = file.total_rows() as u64;

        let mut applied = 0u64;
        for segment in &file.segments {
            applied += snapshot::apply_segment(pool, segment).await?;
            session.bytes_received = applied;
            self.store.save_recovery_session(session).await?;
        }

        let mut clock = crate::infrastructure::model::VectorClock::new();
        for (node, value) in &file.header.clock_manifest {
            for _ in 0..*value {
                clock.increment(node);
            }
        }
        let max_lamport = file.header.clock_manifest.values().copied().max().unwrap_or(0);
        self.clock.merge(&clock, max_lamport).await?;
        self.change_store.prune_acked_events(self.config.retention_days).await.ok();

        Ok(applied)
    }

    /// Background sweep implementing the hybrid retention policy (§4.6):
    /// peer-ack-based or a hard 14-day cap, whichever comes first.
    pub async fn run_retention_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match self.change_store.prune_acked_events(self.config.retention_days).await {
                Ok(pruned) if pruned > 0 => {
                    tracing::debug!(pruned, "retention sweep pruned acked sync_events");
                }
                Ok(_) => {}
                Err(e) => warn!("retention sweep failed: {}", e),
            }
        }
    }
}

trait DataDirExt {
    fn data_dir_subpath(&self, sub: &str) -> String;
}

impl DataDirExt for SyncConfig {
    fn data_dir_subpath(&self, sub: &str) -> String {
        format!("{}/{}", self.data_dir.trim_end_matches('/'), sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_metrics_compute_rate_and_average() {
        let mut metrics = RecoveryMetrics::default();
        metrics.total = 4;
        metrics.successful = 3;
        metrics.failed = 1;
        metrics.total_duration_ms = 800;
        assert_eq!(metrics.average_duration_ms(), 200);
        assert!((metrics.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn recovery_metrics_with_no_attempts_reports_full_success_rate() {
        let metrics = RecoveryMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);
        assert_eq!(metrics.average_duration_ms(), 0);
    }
}
