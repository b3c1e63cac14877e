//! C2 — Change Tracker. Sits between business writes and the store, stamping
//! every captured mutation with causal metadata before it is persisted to the
//! outbound log (§4.2). Explicitly owned and constructed by the Service
//! Runner rather than a module-scoped singleton (§9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::infrastructure::clock::{node_version, ClockIdentity};
use crate::infrastructure::model::{ChangeEvent, ChangeEventMetadata, ChangeOperation};
use crate::infrastructure::traits::ChangeStore;

/// Tables whose mutations are never captured (§3).
pub const EXCLUDED_TABLES: &[&str] = &[
    "accounts",
    "sessions",
    "verification_tokens",
    "audit_logs",
    "sync_nodes",
    "sync_events",
    "conflict_resolutions",
    "sync_sessions",
    "network_partitions",
    "sync_metrics",
    "sync_configurations",
];

const OFFLINE_QUEUE_CAPACITY: usize = 1024;

pub struct ChangeTracker {
    node_id: String,
    registration_key_hash: String,
    clock: Arc<ClockIdentity>,
    store: Arc<dyn ChangeStore>,
    enabled: AtomicBool,
    offline_queue: Mutex<VecDeque<ChangeEvent>>,
    signal_tx: mpsc::Sender<()>,
}

pub fn is_excluded(table_name: &str) -> bool {
    EXCLUDED_TABLES.contains(&table_name)
}

impl ChangeTracker {
    pub fn new(
        node_id: String,
        registration_key_hash: String,
        clock: Arc<ClockIdentity>,
        store: Arc<dyn ChangeStore>,
    ) -> (Self, mpsc::Receiver<()>) {
        let (signal_tx, signal_rx) = mpsc::channel(64);
        (
            Self {
                node_id,
                registration_key_hash,
                clock,
                store,
                enabled: AtomicBool::new(true),
                offline_queue: Mutex::new(VecDeque::with_capacity(OFFLINE_QUEUE_CAPACITY)),
                signal_tx,
            },
            signal_rx,
        )
    }

    /// Disables capture, e.g. while a donor is exporting a snapshot (§4.6 step 2).
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Captures one business-table mutation. Returns `Ok(None)` without doing any
    /// work for excluded tables or while capture is disabled — in both cases the
    /// business write is expected to proceed regardless.
    #[instrument(skip(self, change_data, before_data))]
    pub async fn capture(
        &self,
        table_name: &str,
        record_id: &str,
        operation: ChangeOperation,
        change_data: serde_json::Value,
        before_data: Option<serde_json::Value>,
    ) -> AppResult<Option<ChangeEvent>> {
        if is_excluded(table_name) || !self.is_enabled() {
            return Ok(None);
        }

        if !change_data.is_object() && !matches!(operation, ChangeOperation::Delete) {
            return Err(AppError::Validation(format!(
                "change_data for {}/{} must serialize to an object",
                table_name, record_id
            )));
        }

        let (vector_clock, lamport_clock) = self.clock.tick().await?;
        let checksum = ClockIdentity::checksum(&change_data);

        let event = ChangeEvent {
            event_id: Uuid::new_v4().to_string(),
            source_node_id: self.node_id.clone(),
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
            operation,
            change_data,
            before_data,
            vector_clock,
            lamport_clock,
            checksum,
            priority: 5,
            metadata: ChangeEventMetadata {
                timestamp: chrono::Utc::now(),
                node_version: node_version(),
                registration_key_hash: self.registration_key_hash.clone(),
            },
        };

        match self.store.append_event(&event).await {
            Ok(()) => {
                let _ = self.signal_tx.try_send(());
                Ok(Some(event))
            }
            Err(e) => {
                // No DB connection: queue in memory rather than silently drop a
                // captured event (§4.2 edge cases).
                self.enqueue_offline(event).await;
                Err(e)
            }
        }
    }

    async fn enqueue_offline(&self, event: ChangeEvent) {
        let mut queue = self.offline_queue.lock().await;
        if queue.len() >= OFFLINE_QUEUE_CAPACITY {
            queue.pop_front();
            warn!("offline change-event queue overflowed; dropped oldest event");
        }
        queue.push_back(event);
    }

    /// Replays buffered events once connectivity returns. Stops at the first
    /// failure and leaves the remainder queued for the next attempt.
    #[instrument(skip(self))]
    pub async fn drain_offline_queue(&self) -> AppResult<u64> {
        let mut replayed = 0u64;
        loop {
            let event = {
                let mut queue = self.offline_queue.lock().await;
                match queue.pop_front() {
                    Some(event) => event,
                    None => break,
                }
            };
            if let Err(e) = self.store.append_event(&event).await {
                let mut queue = self.offline_queue.lock().await;
                queue.push_front(event);
                return Err(e);
            }
            replayed += 1;
            let _ = self.signal_tx.try_send(());
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::model::NodeIdentity;
    use crate::infrastructure::store::SyncStore;
    use serde_json::json;

    async fn tracker_for(node_id: &str) -> (ChangeTracker, mpsc::Receiver<()>, Arc<SyncStore>) {
        let store = Arc::new(SyncStore::new("sqlite::memory:").await.unwrap());
        store.init().await.unwrap();
        let identity = NodeIdentity::new(node_id.into(), "127.0.0.1".into(), 8765, "hash".into());
        store.save_identity(&identity).await.unwrap();
        let clock = Arc::new(ClockIdentity::load(&identity, store.clone()).await.unwrap());
        let (tracker, rx) = ChangeTracker::new(
            identity.node_id.clone(),
            identity.registration_key_hash.clone(),
            clock,
            store.clone(),
        );
        (tracker, rx, store)
    }

    #[tokio::test]
    async fn captures_non_excluded_table() {
        let (tracker, _rx, _store) = tracker_for("node-a").await;
        let event = tracker
            .capture(
                "widgets",
                "r1",
                ChangeOperation::Create,
                json!({"name": "alpha"}),
                None,
            )
            .await
            .unwrap();
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn exclusion_list_never_produces_events() {
        let (tracker, _rx, _store) = tracker_for("node-a").await;
        for table in EXCLUDED_TABLES {
            let event = tracker
                .capture(table, "r1", ChangeOperation::Update, json!({"x": 1}), None)
                .await
                .unwrap();
            assert!(event.is_none(), "table {} should be excluded", table);
        }
    }

    #[tokio::test]
    async fn disabled_tracker_captures_nothing() {
        let (tracker, _rx, _store) = tracker_for("node-a").await;
        tracker.disable();
        let event = tracker
            .capture("widgets", "r1", ChangeOperation::Create, json!({"a": 1}), None)
            .await
            .unwrap();
        assert!(event.is_none());
    }
}
