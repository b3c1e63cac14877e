//! C5 — Sync Engine. Per-peer authenticate/pull/apply/push cycles and the
//! deterministic conflict resolver (§4.5). Grounded on this codebase's
//! replication manager: a per-peer scheduled background task, a shared
//! clock, and a pluggable resolver invoked only on genuine concurrency.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{RecoveryConfig, SyncConfig};
use crate::error::{AppError, AppResult};
use crate::infrastructure::clock::ClockIdentity;
use crate::infrastructure::discovery::PeerDiscovery;
use crate::infrastructure::model::{
    ChangeEvent, ChangeOperation, ClockOrdering, ConflictKind, ConflictResolution, NodeId,
    PeerRecord, Reachability,
};
use crate::infrastructure::partition::PartitionDetector;
use crate::infrastructure::security::{fresh_nonce, AuthRequest, SecurityManager};
use crate::infrastructure::traits::{ChangeStore, MetricsInterface};
use crate::infrastructure::wire::{
    self, build_frame, decode_payload, read_frame, write_frame, EventBatchPayload, MessageType,
    ProcessedAckPayload, PullRequestPayload, SessionOkPayload, SessionOpenPayload,
    SnapshotChunkPayload, SnapshotReadyPayload, SnapshotRequestPayload,
};
use sqlx::sqlite::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncPhase {
    Idle,
    Authenticating,
    Sessioned,
    Syncing,
    Failed,
}

struct PeerSyncState {
    phase: PeerSyncPhase,
    session_id: Option<String>,
    session_key: Option<Vec<u8>>,
    backoff: Duration,
    next_attempt_at: std::time::Instant,
}

impl Default for PeerSyncState {
    fn default() -> Self {
        Self {
            phase: PeerSyncPhase::Idle,
            session_id: None,
            session_key: None,
            backoff: Duration::from_secs(1),
            next_attempt_at: std::time::Instant::now(),
        }
    }
}

pub struct SyncEngine {
    node_id: NodeId,
    store: Arc<dyn ChangeStore>,
    security: Arc<SecurityManager>,
    discovery: Arc<PeerDiscovery>,
    clock: Arc<ClockIdentity>,
    metrics: Arc<dyn MetricsInterface>,
    config: SyncConfig,
    recovery_config: RecoveryConfig,
    partition_detector: Arc<PartitionDetector>,
    pool: SqlitePool,
    peer_states: RwLock<HashMap<NodeId, PeerSyncState>>,
}

const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn ChangeStore>,
        security: Arc<SecurityManager>,
        discovery: Arc<PeerDiscovery>,
        clock: Arc<ClockIdentity>,
        metrics: Arc<dyn MetricsInterface>,
        config: SyncConfig,
        recovery_config: RecoveryConfig,
        partition_detector: Arc<PartitionDetector>,
        pool: SqlitePool,
    ) -> Self {
        Self {
            node_id,
            store,
            security,
            discovery,
            clock,
            metrics,
            config,
            recovery_config,
            partition_detector,
            pool,
            peer_states: RwLock::new(HashMap::new()),
        }
    }

    /// Spawns the scheduled per-peer loop and the incoming-connection server
    /// loop. Called once by the Service Runner after C1-C4 are up.
    pub async fn start(self: &Arc<Self>, listen_port: u16) -> AppResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await.map_err(|e| {
            AppError::Internal(format!("failed to bind sync listener: {}", e))
        })?;
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.run_server(listener).await;
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_scheduled_cycles().await;
        });

        Ok(())
    }

    #[instrument(skip(self, signal_rx))]
    pub async fn run_triggered_by_local_events(self: Arc<Self>, mut signal_rx: mpsc::Receiver<()>) {
        while signal_rx.recv().await.is_some() {
            let peers = self.discovery.known_peers().await;
            for peer in peers.into_iter().filter(|p| p.reachability == Reachability::Reachable) {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    engine.run_cycle_guarded(&peer).await;
                });
            }
        }
    }

    async fn run_scheduled_cycles(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        loop {
            interval.tick().await;
            let peers = self.discovery.known_peers().await;
            for peer in peers.into_iter().filter(|p| p.reachability == Reachability::Reachable) {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    engine.run_cycle_guarded(&peer).await;
                });
            }
        }
    }

    async fn run_cycle_guarded(&self, peer: &PeerRecord) {
        let never_synced = {
            let states = self.peer_states.read().await;
            match states.get(&peer.node_id) {
                Some(state) => {
                    if state.phase == PeerSyncPhase::Failed && std::time::Instant::now() < state.next_attempt_at {
                        return;
                    }
                    false
                }
                None => true,
            }
        };

        // First cycle ever toward a peer we've never pulled anything from:
        // try the bulk snapshot join before falling back to incremental sync
        // (§4.6 steps 1-5). A failure here just means we proceed as usual.
        if never_synced && peer.local_high_watermark == 0 {
            if let Err(e) = self.join_via_snapshot(peer).await {
                warn!(peer = %peer.node_id, error = %e, "bulk snapshot join failed, falling back to incremental sync");
            }
        }

        let outcome = self.sync_with_peer(peer).await;
        let success = outcome.is_ok();
        let events_applied = outcome.unwrap_or(0);
        self.metrics.record_sync_cycle(&peer.node_id, events_applied, success).await;

        let mut states = self.peer_states.write().await;
        let state = states.entry(peer.node_id.clone()).or_default();
        if success {
            state.phase = PeerSyncPhase::Idle;
            state.backoff = Duration::from_secs(1);
        } else {
            state.phase = PeerSyncPhase::Failed;
            state.next_attempt_at = std::time::Instant::now() + state.backoff;
            state.backoff = (state.backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// One authenticate/pull/apply/push cycle toward a single reachable peer
    /// (§4.5). Returns the number of events applied on success. Public so the
    /// scheduled loop and an operator-triggered "sync now" can share one path.
    #[instrument(skip(self, peer))]
    pub async fn sync_with_peer(&self, peer: &PeerRecord) -> AppResult<u64> {
        let mut stream = TcpStream::connect(&peer.endpoint)
            .await
            .map_err(|e| AppError::TimeoutError(format!("connect to {} failed: {}", peer.endpoint, e)))?;

        let (session_id, session_key) = self.ensure_session(&mut stream, peer).await?;

        let pulled = self.pull_phase(&mut stream, &session_id, session_key.as_slice(), peer).await?;
        let applied = self.apply_phase(pulled, peer).await?;
        self.push_phase(&mut stream, &session_id, session_key.as_slice(), peer).await?;

        Ok(applied)
    }

    /// Joiner side of the bulk snapshot protocol (§4.6 steps 1-5): requests a
    /// consistent snapshot from `peer`, streams it down in
    /// `snapshot_chunk_bytes`-sized chunks, applies it, and fast-forwards our
    /// discovery watermark for the peer to the snapshot's clock manifest so
    /// the next incremental pull resumes right after it. Public so the
    /// scheduled loop's first-contact trigger and an operator-triggered
    /// "join now" can share one path.
    #[instrument(skip(self, peer))]
    pub async fn join_via_snapshot(&self, peer: &PeerRecord) -> AppResult<u64> {
        let mut stream = TcpStream::connect(&peer.endpoint)
            .await
            .map_err(|e| AppError::TimeoutError(format!("connect to {} failed: {}", peer.endpoint, e)))?;
        let (session_id, session_key) = self.ensure_session(&mut stream, peer).await?;

        let request = SnapshotRequestPayload {
            session_id: session_id.clone(),
            last_known_lamport: peer.local_high_watermark,
        };
        let frame = build_frame(
            MessageType::SnapshotRequest,
            Some(session_id.clone()),
            &request,
            Some(session_key.as_slice()),
        )?;
        write_frame(&mut stream, &frame).await?;

        let response = read_frame(&mut stream).await?;
        if response.message_type != MessageType::SnapshotReady {
            return Err(AppError::TimeoutError("peer did not offer a snapshot".into()));
        }
        if !wire::verify_frame_hmac(&session_key, &response) {
            return Err(AppError::Integrity("snapshot-ready frame failed hmac verification".into()));
        }
        let ready: SnapshotReadyPayload = decode_payload(&response)?;

        let backups_dir = format!("{}/backups", self.config.data_dir.trim_end_matches('/'));
        tokio::fs::create_dir_all(&backups_dir)
            .await
            .map_err(|e| AppError::Internal(format!("failed to create backups dir: {}", e)))?;
        let local_path = std::path::Path::new(&backups_dir).join(&ready.filename);

        let mut file = tokio::fs::File::create(&local_path)
            .await
            .map_err(|e| AppError::Internal(format!("failed to create snapshot file: {}", e)))?;
        let mut received = 0u64;
        while received < ready.bytes {
            let chunk_frame = read_frame(&mut stream).await?;
            if chunk_frame.message_type != MessageType::SnapshotChunk {
                return Err(AppError::Integrity("expected a snapshot chunk".into()));
            }
            if !wire::verify_frame_hmac(&session_key, &chunk_frame) {
                return Err(AppError::Integrity("snapshot chunk failed hmac verification".into()));
            }
            let chunk: SnapshotChunkPayload = decode_payload(&chunk_frame)?;
            file.write_all(&chunk.bytes)
                .await
                .map_err(|e| AppError::Internal(format!("failed to write snapshot chunk: {}", e)))?;
            received += chunk.bytes.len() as u64;
        }
        file.flush().await.ok();
        drop(file);

        let applied = self
            .partition_detector
            .apply_snapshot(&self.pool, &peer.node_id, &local_path)
            .await?;
        let max_lamport = ready.clock_manifest.values().copied().max().unwrap_or(0);
        self.discovery.record_watermark(&peer.node_id, max_lamport).await?;
        info!(peer = %peer.node_id, rows = applied, bytes = ready.bytes, "joined peer via bulk snapshot");
        Ok(applied)
    }

    async fn ensure_session(
        &self,
        stream: &mut TcpStream,
        peer: &PeerRecord,
    ) -> AppResult<(String, Vec<u8>)> {
        {
            let states = self.peer_states.read().await;
            if let Some(state) = states.get(&peer.node_id) {
                if let (Some(session_id), Some(key)) = (&state.session_id, &state.session_key) {
                    return Ok((session_id.clone(), key.clone()));
                }
            }
        }

        let nonce = fresh_nonce();
        let request = self.security.build_auth_request(&nonce).await;
        let auth_token = self.perform_handshake(stream, request).await?;

        let session_key = self
            .security
            .derive_symmetric_key_as_initiator(&auth_token, &self.node_id, &peer.node_id)
            .await;

        let session_open = SessionOpenPayload {
            auth_token: auth_token.clone(),
            key_agreement_blob: String::new(),
        };
        let frame = build_frame(MessageType::SessionOpen, None, &session_open, None)?;
        write_frame(stream, &frame).await?;
        let response = read_frame(stream).await?;
        if response.message_type != MessageType::SessionOk {
            return Err(AppError::Unauthorized("peer rejected session open".into()));
        }
        let session_ok: SessionOkPayload = decode_payload(&response)?;

        let mut states = self.peer_states.write().await;
        let state = states.entry(peer.node_id.clone()).or_default();
        state.phase = PeerSyncPhase::Sessioned;
        state.session_id = Some(session_ok.session_id.clone());
        state.session_key = Some(session_key.clone());

        Ok((session_ok.session_id, session_key))
    }

    async fn perform_handshake(&self, stream: &mut TcpStream, request: AuthRequest) -> AppResult<String> {
        let frame = build_frame(MessageType::AuthRequest, None, &request, None)?;
        write_frame(stream, &frame).await?;
        let response = read_frame(stream).await?;
        if response.message_type != MessageType::AuthResponse {
            return Err(AppError::Unauthorized("peer rejected authentication".into()));
        }
        let auth_response: crate::infrastructure::security::AuthResponse = decode_payload(&response)?;
        Ok(auth_response.auth_token)
    }

    async fn pull_phase(
        &self,
        stream: &mut TcpStream,
        session_id: &str,
        session_key: &[u8],
        peer: &PeerRecord,
    ) -> AppResult<Vec<ChangeEvent>> {
        let request = PullRequestPayload {
            since_lamport: peer.local_high_watermark,
            max_batch: self.config.max_batch_size,
            filters: None,
        };
        let frame = build_frame(
            MessageType::PullRequest,
            Some(session_id.to_string()),
            &request,
            Some(session_key),
        )?;
        write_frame(stream, &frame).await?;

        let response = read_frame(stream).await?;
        if response.message_type != MessageType::EventBatch {
            return Err(AppError::TimeoutError("peer did not return an event batch".into()));
        }
        if !wire::verify_frame_hmac(session_key, &response) {
            return Err(AppError::Integrity("event batch failed hmac verification".into()));
        }
        let batch: EventBatchPayload = decode_payload(&response)?;
        Ok(batch.events)
    }

    /// Applies each pulled event in order, running the conflict resolver on
    /// anything concurrent with already-known local state (§4.5 step 3).
    async fn apply_phase(&self, events: Vec<ChangeEvent>, peer: &PeerRecord) -> AppResult<u64> {
        let mut applied = 0u64;
        let mut high_watermark = peer.local_high_watermark;
        let mut acked = Vec::new();
        let mut merged_clock = crate::infrastructure::model::VectorClock::new();

        for event in events {
            if self.store.is_quarantined(&event.event_id).await? {
                continue;
            }
            if ClockIdentity::checksum(&event.change_data) != event.checksum {
                self.store
                    .quarantine(&event.event_id, "checksum mismatch on apply")
                    .await?;
                warn!(event_id = %event.event_id, "quarantined event: checksum mismatch");
                continue;
            }
            if !self
                .security
                .verify_registration_key_hash_for(&event.source_node_id, &event.metadata.registration_key_hash)
                .await
            {
                self.store
                    .quarantine(&event.event_id, "registration key hash mismatch on apply")
                    .await?;
                warn!(event_id = %event.event_id, "quarantined event: identity mismatch");
                continue;
            }

            match self.reconcile_and_apply(&event).await {
                Ok(true) => {
                    self.store.mark_processed(&event.event_id, &self.node_id).await?;
                    high_watermark = high_watermark.max(event.lamport_clock);
                    merged_clock.merge(&event.vector_clock);
                    acked.push(event.event_id.clone());
                    applied += 1;
                }
                Ok(false) => {
                    // Superseded by a local event already AFTER it; ack without applying.
                    self.store.mark_processed(&event.event_id, &self.node_id).await?;
                    high_watermark = high_watermark.max(event.lamport_clock);
                    acked.push(event.event_id);
                }
                Err(e) => {
                    warn!(event_id = %event.event_id, error = %e, "apply failed, will retry next cycle");
                }
            }
        }

        if applied > 0 {
            self.clock.merge(&merged_clock, high_watermark).await?;
        }
        self.discovery.record_watermark(&peer.node_id, high_watermark).await?;
        Ok(applied)
    }

    /// Compares `event` against the latest locally-known event for the same
    /// record. Returns `Ok(true)` if it was applied, `Ok(false)` if it was a
    /// no-op (superseded). An applied event is journaled and materialized onto
    /// the business table as one logical unit (§4.5 step 3d) before returning.
    async fn reconcile_and_apply(&self, event: &ChangeEvent) -> AppResult<bool> {
        let local = self
            .store
            .latest_event_for_record(&event.table_name, &event.record_id)
            .await?;

        let Some(local_event) = local else {
            self.materialize(event).await?;
            return Ok(true);
        };

        match local_event.vector_clock.compare(&event.vector_clock) {
            ClockOrdering::Before => {
                self.materialize(event).await?;
                Ok(true)
            }
            ClockOrdering::Equal => Ok(false),
            ClockOrdering::After => Ok(false),
            ClockOrdering::Concurrent => {
                let resolution = resolve_conflict(&local_event, event);
                let winner_is_remote = resolution.winner_event_id == event.event_id;
                self.store.record_conflict_resolution(&resolution).await?;
                if winner_is_remote {
                    self.materialize(event).await?;
                }
                if let Some(derived_record_id) = &resolution.derived_record_id {
                    // CREATE/CREATE: the loser keeps its original journal entry but
                    // its payload is preserved under a synthetic record id so an
                    // operator can reclaim it later.
                    let loser = if winner_is_remote { &local_event } else { event };
                    self.store.append_event(loser).await?;
                    let mut derived = loser.clone();
                    derived.record_id = derived_record_id.clone();
                    self.store.apply_business_mutation(&derived).await?;
                }
                Ok(winner_is_remote)
            }
        }
    }

    /// Journals a remote event into the local log (so it can be relayed and so
    /// it becomes the new "latest known event" for its record) and applies its
    /// effect to the business table it targets.
    async fn materialize(&self, event: &ChangeEvent) -> AppResult<()> {
        self.store.append_event(event).await?;
        self.store.apply_business_mutation(event).await?;
        Ok(())
    }

    async fn push_phase(
        &self,
        stream: &mut TcpStream,
        session_id: &str,
        session_key: &[u8],
        peer: &PeerRecord,
    ) -> AppResult<()> {
        let outbound: Vec<_> = self
            .store
            .events_since(&peer.node_id, 0, self.config.max_batch_size)
            .await?
            .into_iter()
            // Never echo an event back to the peer it originated from.
            .filter(|e| e.source_node_id != peer.node_id)
            .collect();
        if outbound.is_empty() {
            return Ok(());
        }

        let batch = EventBatchPayload {
            events: outbound.clone(),
            has_more: false,
        };
        let frame = build_frame(
            MessageType::EventBatch,
            Some(session_id.to_string()),
            &batch,
            Some(session_key),
        )?;
        write_frame(stream, &frame).await?;

        let response = read_frame(stream).await?;
        if response.message_type == MessageType::ProcessedAck {
            let ack: ProcessedAckPayload = decode_payload(&response)?;
            for event_id in ack.event_ids {
                self.store.mark_processed(&event_id, &peer.node_id).await?;
            }
        }
        Ok(())
    }

    /// Accepts inbound peer connections and serves the responder side of the
    /// protocol: AUTH_REQUEST/SESSION_OPEN/PULL_REQUEST/EVENT_BATCH.
    async fn run_server(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("sync listener accept failed: {}", e);
                    continue;
                }
            };
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = engine.serve_connection(stream, addr.to_string()).await {
                    warn!(peer = %addr, error = %e, "sync connection terminated with error");
                }
            });
        }
    }

    #[instrument(skip(self, stream))]
    async fn serve_connection(&self, mut stream: TcpStream, source_address: String) -> AppResult<()> {
        let frame = read_frame(&mut stream).await?;
        if frame.message_type != MessageType::AuthRequest {
            return Err(AppError::Unauthorized("expected AUTH_REQUEST as first frame".into()));
        }
        let request: AuthRequest = decode_payload(&frame)?;
        let initiator_node_id = request.node_id.clone();

        let auth_response = match self.security.handle_auth_request(&request, &source_address).await {
            Ok(resp) => resp,
            Err(e) => {
                self.write_error(&mut stream, &e.to_string()).await?;
                return Err(e);
            }
        };
        let response_frame = build_frame(MessageType::AuthResponse, None, &auth_response, None)?;
        write_frame(&mut stream, &response_frame).await?;

        let frame = read_frame(&mut stream).await?;
        if frame.message_type != MessageType::SessionOpen {
            return Err(AppError::Unauthorized("expected SESSION_OPEN after AUTH_RESPONSE".into()));
        }
        let session_open: SessionOpenPayload = decode_payload(&frame)?;
        let session = self
            .security
            .open_session(&session_open.auth_token, &self.node_id, &source_address)
            .await?;

        let session_ok = SessionOkPayload {
            session_id: session.session_id.clone(),
            key_agreement_blob: String::new(),
        };
        let ok_frame = build_frame(MessageType::SessionOk, None, &session_ok, None)?;
        write_frame(&mut stream, &ok_frame).await?;

        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            if !wire::verify_frame_hmac(&session.symmetric_key, &frame) {
                warn!(peer = %initiator_node_id, "dropped frame with invalid hmac");
                continue;
            }
            match frame.message_type {
                MessageType::PullRequest => {
                    let request: PullRequestPayload = decode_payload(&frame)?;
                    let events = self
                        .store
                        .events_since(&initiator_node_id, request.since_lamport, request.max_batch)
                        .await?;
                    let batch = EventBatchPayload { events, has_more: false };
                    let batch_frame = build_frame(
                        MessageType::EventBatch,
                        Some(session.session_id.clone()),
                        &batch,
                        Some(&session.symmetric_key),
                    )?;
                    write_frame(&mut stream, &batch_frame).await?;
                }
                MessageType::EventBatch => {
                    let batch: EventBatchPayload = decode_payload(&frame)?;
                    let peer_record = PeerRecord {
                        node_id: initiator_node_id.clone(),
                        node_name: initiator_node_id.clone(),
                        endpoint: source_address.clone(),
                        capabilities: Default::default(),
                        last_seen: chrono::Utc::now(),
                        reachability: Reachability::Reachable,
                        local_high_watermark: 0,
                        peer_reported_lamport: 0,
                    };
                    let applied = self.apply_phase(batch.events.clone(), &peer_record).await?;
                    let _ = applied;
                    let ack = ProcessedAckPayload {
                        event_ids: batch.events.into_iter().map(|e| e.event_id).collect(),
                    };
                    let ack_frame = build_frame(
                        MessageType::ProcessedAck,
                        Some(session.session_id.clone()),
                        &ack,
                        Some(&session.symmetric_key),
                    )?;
                    write_frame(&mut stream, &ack_frame).await?;
                }
                MessageType::HealthPing => {
                    let pong = build_frame(MessageType::HealthPong, Some(session.session_id.clone()), &(), Some(&session.symmetric_key))?;
                    write_frame(&mut stream, &pong).await?;
                }
                MessageType::SnapshotRequest => {
                    let _request: SnapshotRequestPayload = decode_payload(&frame)?;
                    let tables = self.recovery_config.business_table_pairs();
                    let (filename, bytes, clock_manifest) =
                        self.partition_detector.export_snapshot(&self.pool, &tables).await?;

                    let ready = SnapshotReadyPayload { filename: filename.clone(), bytes, clock_manifest };
                    let ready_frame = build_frame(
                        MessageType::SnapshotReady,
                        Some(session.session_id.clone()),
                        &ready,
                        Some(&session.symmetric_key),
                    )?;
                    write_frame(&mut stream, &ready_frame).await?;

                    let backups_dir = format!("{}/backups", self.config.data_dir.trim_end_matches('/'));
                    let path = std::path::Path::new(&backups_dir).join(&filename);
                    let mut file = tokio::fs::File::open(&path)
                        .await
                        .map_err(|e| AppError::Internal(format!("failed to open snapshot file: {}", e)))?;
                    let mut offset = 0u64;
                    let mut buf = vec![0u8; self.recovery_config.snapshot_chunk_bytes];
                    loop {
                        let n = file
                            .read(&mut buf)
                            .await
                            .map_err(|e| AppError::Internal(format!("failed to read snapshot file: {}", e)))?;
                        if n == 0 {
                            break;
                        }
                        let chunk = SnapshotChunkPayload { offset, bytes: buf[..n].to_vec() };
                        let chunk_frame = build_frame(
                            MessageType::SnapshotChunk,
                            Some(session.session_id.clone()),
                            &chunk,
                            Some(&session.symmetric_key),
                        )?;
                        write_frame(&mut stream, &chunk_frame).await?;
                        offset += n as u64;
                    }
                }
                _ => break,
            }
        }

        Ok(())
    }

    async fn write_error<W: AsyncWrite + Unpin>(&self, stream: &mut W, message: &str) -> AppResult<()> {
        let payload = wire::ErrorPayload {
            message: message.to_string(),
        };
        let frame = build_frame(MessageType::Error, None, &payload, None)?;
        write_frame(stream, &frame).await?;
        stream.flush().await.ok();
        Ok(())
    }
}

/// Deterministic conflict resolution for two CONCURRENT events on the same
/// `(tableName, recordId)` (§4.5). Pure: same inputs always yield the same
/// verdict on every node.
pub fn resolve_conflict(a: &ChangeEvent, b: &ChangeEvent) -> ConflictResolution {
    let now = chrono::Utc::now();

    if matches!(a.operation, ChangeOperation::Delete) != matches!(b.operation, ChangeOperation::Delete) {
        let (winner, loser) = if matches!(a.operation, ChangeOperation::Delete) {
            (a, b)
        } else {
            (b, a)
        };
        return ConflictResolution {
            id: Uuid::new_v4().to_string(),
            table_name: winner.table_name.clone(),
            record_id: winner.record_id.clone(),
            kind: ConflictKind::DeleteWins,
            winner_event_id: winner.event_id.clone(),
            loser_event_id: loser.event_id.clone(),
            derived_record_id: None,
            resolved_at: now,
        };
    }

    if matches!(a.operation, ChangeOperation::Create) && matches!(b.operation, ChangeOperation::Create) {
        let (winner, loser) = match a.source_node_id.cmp(&b.source_node_id) {
            CmpOrdering::Less | CmpOrdering::Equal => (a, b),
            CmpOrdering::Greater => (b, a),
        };
        return ConflictResolution {
            id: Uuid::new_v4().to_string(),
            table_name: winner.table_name.clone(),
            record_id: winner.record_id.clone(),
            kind: ConflictKind::CreateCreate,
            winner_event_id: winner.event_id.clone(),
            loser_event_id: loser.event_id.clone(),
            derived_record_id: Some(format!("{}~{}", loser.record_id, loser.source_node_id)),
            resolved_at: now,
        };
    }

    // Default: last-writer-wins by Lamport clock, tie-break by nodeId.
    let (winner, loser) = match a.lamport_clock.cmp(&b.lamport_clock) {
        CmpOrdering::Greater => (a, b),
        CmpOrdering::Less => (b, a),
        CmpOrdering::Equal => match a.source_node_id.cmp(&b.source_node_id) {
            CmpOrdering::Less | CmpOrdering::Equal => (a, b),
            CmpOrdering::Greater => (b, a),
        },
    };

    ConflictResolution {
        id: Uuid::new_v4().to_string(),
        table_name: winner.table_name.clone(),
        record_id: winner.record_id.clone(),
        kind: ConflictKind::LastWriterWins,
        winner_event_id: winner.event_id.clone(),
        loser_event_id: loser.event_id.clone(),
        derived_record_id: None,
        resolved_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::model::{ChangeEventMetadata, VectorClock};
    use serde_json::json;

    fn event(source: &str, lamport: u64, op: ChangeOperation) -> ChangeEvent {
        ChangeEvent {
            event_id: format!("{}-{}", source, lamport),
            source_node_id: source.to_string(),
            table_name: "widgets".into(),
            record_id: "r1".into(),
            operation: op,
            change_data: json!({"name": "x"}),
            before_data: None,
            vector_clock: VectorClock::new(),
            lamport_clock: lamport,
            checksum: ClockIdentity::checksum(&json!({"name": "x"})),
            priority: 5,
            metadata: ChangeEventMetadata {
                timestamp: chrono::Utc::now(),
                node_version: "0.1.0".into(),
                registration_key_hash: "hash".into(),
            },
        }
    }

    #[test]
    fn last_writer_wins_picks_higher_lamport_clock() {
        let a = event("node-a", 5, ChangeOperation::Update);
        let b = event("node-b", 7, ChangeOperation::Update);
        let resolution = resolve_conflict(&a, &b);
        assert_eq!(resolution.winner_event_id, b.event_id);
        assert_eq!(resolution.kind, ConflictKind::LastWriterWins);
    }

    #[test]
    fn delete_beats_concurrent_update_regardless_of_lamport_clock() {
        let update = event("node-a", 10, ChangeOperation::Update);
        let delete = event("node-b", 3, ChangeOperation::Delete);
        let resolution = resolve_conflict(&update, &delete);
        assert_eq!(resolution.winner_event_id, delete.event_id);
        assert_eq!(resolution.kind, ConflictKind::DeleteWins);
    }

    #[test]
    fn create_create_lower_node_id_wins_and_loser_gets_derived_id() {
        let a = event("node-a", 1, ChangeOperation::Create);
        let b = event("node-b", 1, ChangeOperation::Create);
        let resolution = resolve_conflict(&b, &a);
        assert_eq!(resolution.winner_event_id, a.event_id);
        assert!(resolution.derived_record_id.is_some());
    }

    #[test]
    fn resolution_is_symmetric_regardless_of_argument_order() {
        let a = event("node-a", 4, ChangeOperation::Update);
        let b = event("node-b", 9, ChangeOperation::Update);
        let r1 = resolve_conflict(&a, &b);
        let r2 = resolve_conflict(&b, &a);
        assert_eq!(r1.winner_event_id, r2.winner_event_id);
    }
}
