//! C1 — Clock & Identity. Owns the node's vector clock and Lamport clock and
//! the one-time identity bootstrap. Grounded on this codebase's existing
//! vector-clock handling in the replication manager, generalized to the
//! tick/merge/compare/checksum contract the sync core needs.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::infrastructure::model::{ClockOrdering, NodeIdentity, VectorClock};
use crate::infrastructure::traits::ChangeStore;

pub struct ClockIdentity {
    node_id: String,
    store: Arc<dyn ChangeStore>,
    state: Mutex<ClockState>,
}

struct ClockState {
    vector_clock: VectorClock,
    lamport_clock: u64,
}

impl ClockIdentity {
    /// Loads the persisted clock for `identity.node_id`, starting both counters at
    /// zero if this is a brand new install.
    pub async fn load(identity: &NodeIdentity, store: Arc<dyn ChangeStore>) -> AppResult<Self> {
        let (vector_clock, lamport_clock) = match store.load_clock(&identity.node_id).await? {
            Some(pair) => pair,
            None => (VectorClock::new(), 0),
        };
        Ok(Self {
            node_id: identity.node_id.clone(),
            store,
            state: Mutex::new(ClockState {
                vector_clock,
                lamport_clock,
            }),
        })
    }

    /// Increments this node's vector clock entry and the Lamport clock, persists,
    /// then returns the new pair. Persistence failure is fatal: a local event
    /// cannot be issued without a durable clock (§4.1).
    #[instrument(skip(self))]
    pub async fn tick(&self) -> AppResult<(VectorClock, u64)> {
        let mut state = self.state.lock().await;
        let mut candidate_vc = state.vector_clock.clone();
        candidate_vc.increment(&self.node_id);
        let candidate_lamport = state.lamport_clock + 1;

        self.store
            .save_clock(&self.node_id, &candidate_vc, candidate_lamport)
            .await
            .map_err(|e| {
                AppError::Internal(format!("failed to persist clock tick: {}", e))
            })?;

        state.vector_clock = candidate_vc.clone();
        state.lamport_clock = candidate_lamport;
        Ok((candidate_vc, candidate_lamport))
    }

    /// Merges a remote clock into the local one. Merge failures degrade
    /// gracefully: the in-memory clock only advances once persistence succeeds,
    /// so a failed merge is simply retried on the next cycle.
    #[instrument(skip(self, remote_vc))]
    pub async fn merge(&self, remote_vc: &VectorClock, remote_lamport: u64) -> AppResult<(VectorClock, u64)> {
        let mut state = self.state.lock().await;
        let mut candidate_vc = state.vector_clock.clone();
        candidate_vc.merge(remote_vc);
        let candidate_lamport = state.lamport_clock.max(remote_lamport) + 1;

        self.store
            .save_clock(&self.node_id, &candidate_vc, candidate_lamport)
            .await?;

        state.vector_clock = candidate_vc.clone();
        state.lamport_clock = candidate_lamport;
        Ok((candidate_vc, candidate_lamport))
    }

    pub async fn snapshot(&self) -> (VectorClock, u64) {
        let state = self.state.lock().await;
        (state.vector_clock.clone(), state.lamport_clock)
    }

    pub fn compare(a: &VectorClock, b: &VectorClock) -> ClockOrdering {
        a.compare(b)
    }

    /// Canonicalizes `value` by sorting object keys then hashes with SHA-256,
    /// hex encoded. Stable under key reordering (testable property 4).
    pub fn checksum(value: &serde_json::Value) -> String {
        let canonical = canonicalize(value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Recursively sorts object keys and serializes to a stable JSON string.
fn canonicalize(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Computes `H(registrationKey ∥ nodeId)`, the shared-secret proof stored on
/// `NodeIdentity::registration_key_hash` (§3).
pub fn registration_key_hash(registration_key: &str, node_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(registration_key.as_bytes());
    hasher.update(node_id.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn node_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::SyncStore;
    use serde_json::json;

    async fn clock_for(node_id: &str) -> (ClockIdentity, Arc<SyncStore>) {
        let store = Arc::new(SyncStore::new("sqlite::memory:").await.unwrap());
        store.init().await.unwrap();
        let identity = NodeIdentity::new(node_id.into(), "127.0.0.1".into(), 8765, "hash".into());
        store.save_identity(&identity).await.unwrap();
        let clock = ClockIdentity::load(&identity, store.clone()).await.unwrap();
        (clock, store)
    }

    #[tokio::test]
    async fn tick_is_monotonic() {
        let (clock, _store) = clock_for("node-a").await;
        let (vc1, l1) = clock.tick().await.unwrap();
        let (vc2, l2) = clock.tick().await.unwrap();
        assert!(vc2.get("node-a") >= vc1.get("node-a"));
        assert!(l2 > l1);
    }

    #[tokio::test]
    async fn merge_never_decreases_entries() {
        let (clock, _store) = clock_for("node-a").await;
        clock.tick().await.unwrap();
        clock.tick().await.unwrap();
        let (before, _) = clock.snapshot().await;

        let mut remote = VectorClock::new();
        remote.increment("node-b");
        clock.merge(&remote, 1).await.unwrap();
        let (after, _) = clock.snapshot().await;

        assert!(after.get("node-a") >= before.get("node-a"));
        assert_eq!(after.get("node-b"), 1);
    }

    #[test]
    fn checksum_is_stable_under_key_reordering() {
        let a = json!({"name": "alpha", "qty": 3});
        let b = json!({"qty": 3, "name": "alpha"});
        assert_eq!(ClockIdentity::checksum(&a), ClockIdentity::checksum(&b));
    }
}
