//! Crate-level seed-scenario tests (§2.4, §8): real SQLite stores per node,
//! driven over real loopback TCP sockets — no mocked transport. Peers are
//! wired directly rather than through UDP discovery so the scenarios stay
//! deterministic; discovery's own framing is covered by its unit tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use sync_daemon::config::{RecoveryConfig, SyncConfig};
use sync_daemon::infrastructure::change_tracker::ChangeTracker;
use sync_daemon::infrastructure::clock::{node_version, registration_key_hash, ClockIdentity};
use sync_daemon::infrastructure::discovery::PeerDiscovery;
use sync_daemon::infrastructure::model::{
    ChangeEvent, ChangeEventMetadata, ChangeOperation, NodeIdentity, PeerRecord, Reachability,
};
use sync_daemon::infrastructure::monitoring::MetricsCollector;
use sync_daemon::infrastructure::partition::PartitionDetector;
use sync_daemon::infrastructure::security::{SecurityConfig as ManagerSecurityConfig, SecurityManager};
use sync_daemon::infrastructure::store::SyncStore;
use sync_daemon::infrastructure::sync_engine::SyncEngine;
use sync_daemon::infrastructure::traits::{ChangeStore, DiscoveryStore, MetricsInterface, RecoveryStore, SecurityStore};

struct Node {
    identity: NodeIdentity,
    store: Arc<SyncStore>,
    clock: Arc<ClockIdentity>,
    sync_engine: Arc<SyncEngine>,
}

fn default_config(port: u16) -> (sync_daemon::config::DiscoveryConfig, SyncConfig, RecoveryConfig) {
    let discovery = sync_daemon::config::DiscoveryConfig {
        announce_interval_ms: 10_000,
        unreachable_threshold: 6,
        transport: sync_daemon::config::DiscoveryTransport::Broadcast,
        multicast_group: "239.255.42.99".to_string(),
    };
    let sync = SyncConfig {
        node_name: format!("node-{}", port),
        port,
        interval_ms: 30_000,
        max_batch_size: 100,
        data_dir: "./data".to_string(),
        backoff_base_ms: 1_000,
        backoff_cap_ms: 5 * 60 * 1_000,
        network_timeout_ms: 10_000,
        shutdown_timeout_ms: 30_000,
    };
    let recovery = RecoveryConfig {
        consistency_check_cycles: 3,
        retention_days: 14,
        snapshot_chunk_bytes: 64 * 1024,
        business_tables: vec!["widgets".to_string()],
    };
    (discovery, sync, recovery)
}

/// Builds a fully-wired node (C1-C5, minus discovery's own UDP loop) bound to
/// a real TCP listener on `port`, the same dependency order `AppState::new`
/// uses in the Service Runner.
async fn build_node(node_name: &str, registration_key: &str, port: u16) -> Node {
    let store = Arc::new(SyncStore::new("sqlite::memory:").await.unwrap());
    store.init().await.unwrap();
    // The daemon replicates arbitrary business schemas; the embedding app is
    // expected to own them. Stand in for that app with a single "widgets" table.
    sqlx::query("CREATE TABLE widgets (id TEXT PRIMARY KEY, label TEXT)")
        .execute(store.pool())
        .await
        .unwrap();

    let mut identity = NodeIdentity::new(node_name.to_string(), "127.0.0.1".to_string(), port, String::new());
    identity.registration_key_hash = registration_key_hash(registration_key, &identity.node_id);
    store.save_identity(&identity).await.unwrap();

    let clock = Arc::new(
        ClockIdentity::load(&identity, store.clone() as Arc<dyn ChangeStore>)
            .await
            .unwrap(),
    );

    let (change_tracker, _change_signal_rx) = ChangeTracker::new(
        identity.node_id.clone(),
        identity.registration_key_hash.clone(),
        Arc::clone(&clock),
        store.clone() as Arc<dyn ChangeStore>,
    );
    let change_tracker = Arc::new(change_tracker);

    let security = Arc::new(SecurityManager::new(
        identity.node_id.clone(),
        registration_key.to_string(),
        store.clone() as Arc<dyn SecurityStore>,
        ManagerSecurityConfig {
            session_lifetime: Duration::from_secs(3600),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 100,
            max_failed_attempts: 3,
            auth_token_lifetime: Duration::from_secs(300),
            encryption_enabled: true,
        },
    ));

    let (discovery_config, sync_config, recovery_config) = default_config(port);
    let (discovery, _reachability_rx) = PeerDiscovery::new(
        identity.node_id.clone(),
        identity.node_name.clone(),
        identity.endpoint(),
        identity.capabilities.clone(),
        identity.registration_key_hash.clone(),
        port + 1,
        discovery_config,
        store.clone() as Arc<dyn DiscoveryStore>,
        Arc::clone(&clock),
    );
    let discovery = Arc::new(discovery);

    let partition_detector = Arc::new(PartitionDetector::new(
        identity.node_id.clone(),
        store.clone() as Arc<dyn RecoveryStore>,
        store.clone() as Arc<dyn ChangeStore>,
        Arc::clone(&discovery),
        Arc::clone(&clock),
        Arc::clone(&change_tracker),
        sync_config.clone(),
        recovery_config.clone(),
    ));

    let metrics = Arc::new(MetricsCollector::new(
        identity.node_id.clone(),
        identity.node_name.clone(),
        Arc::clone(&discovery),
        Arc::clone(&partition_detector),
    ));

    let sync_engine = Arc::new(SyncEngine::new(
        identity.node_id.clone(),
        store.clone() as Arc<dyn ChangeStore>,
        Arc::clone(&security),
        Arc::clone(&discovery),
        Arc::clone(&clock),
        Arc::clone(&metrics) as Arc<dyn MetricsInterface>,
        sync_config,
        recovery_config,
        Arc::clone(&partition_detector),
        store.pool().clone(),
    ));
    sync_engine.start(port).await.unwrap();

    Node {
        identity,
        store,
        clock,
        sync_engine,
    }
}

fn peer_record_for(node: &Node) -> PeerRecord {
    PeerRecord {
        node_id: node.identity.node_id.clone(),
        node_name: node.identity.node_name.clone(),
        endpoint: node.identity.endpoint(),
        capabilities: node.identity.capabilities.clone(),
        last_seen: chrono::Utc::now(),
        reachability: Reachability::Reachable,
        local_high_watermark: 0,
        peer_reported_lamport: 0,
    }
}

/// Mirrors a locally captured mutation: the embedding app writes the business
/// table itself and then hands the same data to `ChangeTracker::capture` to
/// journal it (§4.2) — here folded into one helper for the test.
async fn capture_local_event(
    node: &Node,
    record_id: &str,
    operation: ChangeOperation,
    change_data: serde_json::Value,
) -> ChangeEvent {
    let (vector_clock, lamport_clock) = node.clock.tick().await.unwrap();
    let checksum = ClockIdentity::checksum(&change_data);
    let event = ChangeEvent {
        event_id: format!("{}-{}", node.identity.node_id, lamport_clock),
        source_node_id: node.identity.node_id.clone(),
        table_name: "widgets".to_string(),
        record_id: record_id.to_string(),
        operation,
        change_data,
        before_data: None,
        vector_clock,
        lamport_clock,
        checksum,
        priority: 5,
        metadata: ChangeEventMetadata {
            timestamp: chrono::Utc::now(),
            node_version: node_version(),
            registration_key_hash: node.identity.registration_key_hash.clone(),
        },
    };
    node.store.append_event(&event).await.unwrap();
    if !matches!(operation, ChangeOperation::Delete) {
        node.store.apply_business_mutation(&event).await.unwrap();
    }
    event
}

/// S1 — two nodes independently CREATE the same record id while offline from
/// each other; one sync cycle must resolve the conflict identically on both
/// sides and record exactly one `conflict_resolutions` row on each.
#[tokio::test]
async fn s1_two_node_create_create_conflict_resolves_identically_on_both_sides() {
    let key = "shared-registration-key";
    let node_a = build_node("alpha", key, 18765).await;
    let node_b = build_node("beta", key, 18766).await;

    let event_a = capture_local_event(&node_a, "r1", ChangeOperation::Create, json!({"label": "alpha-value"})).await;
    let event_b = capture_local_event(&node_b, "r1", ChangeOperation::Create, json!({"label": "beta-value"})).await;

    let peer_b = peer_record_for(&node_b);
    node_a.sync_engine.sync_with_peer(&peer_b).await.unwrap();

    let expected_winner = if node_a.identity.node_id < node_b.identity.node_id {
        event_a.event_id.clone()
    } else {
        event_b.event_id.clone()
    };

    let expected_label = if node_a.identity.node_id < node_b.identity.node_id {
        "alpha-value"
    } else {
        "beta-value"
    };

    for store in [&node_a.store, &node_b.store] {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conflict_resolutions")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1, "each node should record exactly one conflict resolution");

        let (winner_event_id, derived_record_id): (String, Option<String>) =
            sqlx::query_as("SELECT winner_event_id, derived_record_id FROM conflict_resolutions LIMIT 1")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(winner_event_id, expected_winner);
        let derived_record_id = derived_record_id.expect("the losing create should get a derived record id");

        let winner_label: String = sqlx::query_scalar("SELECT label FROM widgets WHERE id = 'r1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(winner_label, expected_label, "the conflict winner's payload should own the original record id");

        let loser_label: String = sqlx::query_scalar("SELECT label FROM widgets WHERE id = ?")
            .bind(&derived_record_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_ne!(loser_label, expected_label, "the loser's payload should survive only under the derived id");
    }
}

/// S2 — node `A` accumulates 50 offline mutations before `B` ever comes up;
/// one sync cycle initiated by `B` must catch every one of them up and fast
/// -forward `B`'s vector clock to match.
#[tokio::test]
async fn s2_fifty_offline_mutations_are_caught_up_in_one_cycle() {
    let key = "shared-registration-key";
    let node_a = build_node("alpha-s2", key, 18965 + 100).await;
    let node_b = build_node("beta-s2", key, 18966 + 100).await;

    for i in 0..50 {
        capture_local_event(
            &node_a,
            &format!("r{}", i),
            ChangeOperation::Create,
            json!({"label": format!("value-{}", i)}),
        )
        .await;
    }

    // A initiates so its own push phase is the one that runs: A connects to
    // B, finds nothing to pull, then pushes its 50-event backlog; B applies
    // them and acks, and A's push phase records the receipts on A's side.
    let peer_b = peer_record_for(&node_b);
    node_a.sync_engine.sync_with_peer(&peer_b).await.unwrap();

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM widgets")
        .fetch_one(node_b.store.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 50, "B should hold every one of A's offline mutations");

    let (vc, _lamport) = node_b.clock.snapshot().await;
    assert_eq!(vc.get(&node_a.identity.node_id), 50, "B's vector clock entry for A should read 50");

    let receipts_on_a: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_event_receipts WHERE receiver_node_id = ?",
    )
    .bind(&node_b.identity.node_id)
    .fetch_one(node_a.store.pool())
    .await
    .unwrap();
    assert_eq!(receipts_on_a, 50, "A should mark all 50 of its events processed for B once acked");
}

/// S3 — two back-to-back updates on `A` for the same record must leave `B`
/// with the later update's value no matter how they are batched together.
#[tokio::test]
async fn s3_back_to_back_updates_leave_the_later_value_on_the_peer() {
    let key = "shared-registration-key";
    let node_a = build_node("alpha-s3", key, 18965 + 200).await;
    let node_b = build_node("beta-s3", key, 18966 + 200).await;

    capture_local_event(&node_a, "r1", ChangeOperation::Update, json!({"label": "first-write"})).await;
    let e2 = capture_local_event(&node_a, "r1", ChangeOperation::Update, json!({"label": "second-write"})).await;

    let peer_a = peer_record_for(&node_a);
    let applied = node_b.sync_engine.sync_with_peer(&peer_a).await.unwrap();
    assert_eq!(applied, 2, "both updates should be applied, the first then overwritten by the second");

    let label: String = sqlx::query_scalar("SELECT label FROM widgets WHERE id = 'r1'")
        .fetch_one(node_b.store.pool())
        .await
        .unwrap();
    assert_eq!(label, "second-write", "the later Lamport-ordered update must be the terminal value");

    let latest = node_b
        .store
        .latest_event_for_record("widgets", "r1")
        .await
        .unwrap()
        .expect("r1 should have a known latest event after sync");
    assert_eq!(latest.event_id, e2.event_id);
}

/// S4 — an event whose checksum does not match its change data is quarantined
/// on apply, never advances the watermark past it, and leaves the session
/// otherwise usable.
#[tokio::test]
async fn s4_tampered_event_is_quarantined_not_applied() {
    let key = "shared-registration-key";
    let node_a = build_node("alpha-s4", key, 18865).await;
    let node_b = build_node("beta-s4", key, 18866).await;

    let mut tampered = capture_local_event(&node_b, "r9", ChangeOperation::Create, json!({"label": "original"})).await;
    // Mutate the in-memory copy only; the persisted row on B keeps the original
    // checksum, so this reproduces a payload corrupted strictly in transit.
    tampered.change_data = json!({"label": "tampered-in-transit"});

    sqlx::query("UPDATE sync_events SET change_data = ? WHERE event_id = ?")
        .bind(serde_json::to_string(&tampered.change_data).unwrap())
        .bind(&tampered.event_id)
        .execute(node_b.store.pool())
        .await
        .unwrap();

    let peer_b = peer_record_for(&node_b);
    let applied = node_a.sync_engine.sync_with_peer(&peer_b).await.unwrap();
    assert_eq!(applied, 0, "a checksum mismatch must not be counted as applied");

    let quarantined = node_a.store.is_quarantined(&tampered.event_id).await.unwrap();
    assert!(quarantined, "tampered event should be quarantined on the receiver");
}

/// S6 — two nodes configured with different registration keys never
/// establish a session and never exchange events.
#[tokio::test]
async fn s6_registration_key_mismatch_blocks_every_handshake() {
    let node_x = build_node("node-x", "key-one", 18965).await;
    let node_y = build_node("node-y", "key-two", 18966).await;

    capture_local_event(&node_y, "r5", ChangeOperation::Create, json!({"label": "from-y"})).await;

    let peer_y = peer_record_for(&node_y);
    let result = node_x.sync_engine.sync_with_peer(&peer_y).await;
    assert!(result.is_err(), "a mismatched registration key must never establish a session");

    let events_on_x: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_events")
        .fetch_one(node_x.store.pool())
        .await
        .unwrap();
    assert_eq!(events_on_x, 0, "no event should have crossed to the unauthenticated side");
}
