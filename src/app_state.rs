//! Shared process state: constructs C1-C6 in their dependency order and
//! hands the Service Runner a ready-to-start set of handles.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::infrastructure::change_tracker::ChangeTracker;
use crate::infrastructure::clock::{registration_key_hash, ClockIdentity};
use crate::infrastructure::discovery::{PeerDiscovery, ReachabilityChange};
use crate::infrastructure::model::NodeIdentity;
use crate::infrastructure::monitoring::MetricsCollector;
use crate::infrastructure::partition::PartitionDetector;
use crate::infrastructure::security::{SecurityConfig as SecurityManagerConfig, SecurityManager};
use crate::infrastructure::store::SyncStore;
use crate::infrastructure::sync_engine::SyncEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub identity: NodeIdentity,
    pub store: Arc<SyncStore>,
    pub clock: Arc<ClockIdentity>,
    pub change_tracker: Arc<ChangeTracker>,
    pub security: Arc<SecurityManager>,
    pub discovery: Arc<PeerDiscovery>,
    pub sync_engine: Arc<SyncEngine>,
    pub partition_detector: Arc<PartitionDetector>,
    pub metrics: Arc<MetricsCollector>,
}

/// Handles the Service Runner must drive after construction: the channel
/// signalling new local changes to C5, and the reachability feed to C6.
pub struct RunnerChannels {
    pub change_signal_rx: Option<mpsc::Receiver<()>>,
    pub reachability_rx: Option<watch::Receiver<Option<ReachabilityChange>>>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<(Self, RunnerChannels)> {
        let store = Arc::new(SyncStore::new(&config.database.url).await?);
        store.init().await?;

        let identity = Self::load_or_bootstrap_identity(&store, &config).await?;

        let clock = Arc::new(ClockIdentity::load(&identity, store.clone() as Arc<dyn crate::infrastructure::traits::ChangeStore>).await?);

        let (change_tracker, change_signal_rx) = ChangeTracker::new(
            identity.node_id.clone(),
            identity.registration_key_hash.clone(),
            Arc::clone(&clock),
            store.clone() as Arc<dyn crate::infrastructure::traits::ChangeStore>,
        );
        let change_tracker = Arc::new(change_tracker);

        let security_config = SecurityManagerConfig {
            session_lifetime: Duration::from_secs(config.security.session_lifetime_secs),
            rate_limit_window: Duration::from_secs(config.security.rate_limit_window_secs),
            rate_limit_max_requests: config.security.rate_limit_max_requests,
            max_failed_attempts: config.security.max_failed_attempts,
            auth_token_lifetime: Duration::from_secs(config.security.session_lifetime_secs),
            encryption_enabled: config.security.encryption_enabled,
        };
        let security = Arc::new(SecurityManager::new(
            identity.node_id.clone(),
            config.security.registration_key.clone(),
            store.clone() as Arc<dyn crate::infrastructure::traits::SecurityStore>,
            security_config,
        ));

        let (discovery, reachability_rx) = PeerDiscovery::new(
            identity.node_id.clone(),
            identity.node_name.clone(),
            identity.endpoint(),
            identity.capabilities.clone(),
            identity.registration_key_hash.clone(),
            config.discovery_port(),
            config.discovery.clone(),
            store.clone() as Arc<dyn crate::infrastructure::traits::DiscoveryStore>,
            Arc::clone(&clock),
        );
        let discovery = Arc::new(discovery);

        let partition_detector = Arc::new(PartitionDetector::new(
            identity.node_id.clone(),
            store.clone() as Arc<dyn crate::infrastructure::traits::RecoveryStore>,
            store.clone() as Arc<dyn crate::infrastructure::traits::ChangeStore>,
            Arc::clone(&discovery),
            Arc::clone(&clock),
            Arc::clone(&change_tracker),
            config.sync.clone(),
            config.recovery.clone(),
        ));

        let metrics = Arc::new(MetricsCollector::new(
            identity.node_id.clone(),
            identity.node_name.clone(),
            Arc::clone(&discovery),
            Arc::clone(&partition_detector),
        ));

        let sync_engine = Arc::new(SyncEngine::new(
            identity.node_id.clone(),
            store.clone() as Arc<dyn crate::infrastructure::traits::ChangeStore>,
            Arc::clone(&security),
            Arc::clone(&discovery),
            Arc::clone(&clock),
            Arc::clone(&metrics) as Arc<dyn crate::infrastructure::traits::MetricsInterface>,
            config.sync.clone(),
            config.recovery.clone(),
            Arc::clone(&partition_detector),
            store.pool().clone(),
        ));

        let state = Self {
            config,
            identity,
            store,
            clock,
            change_tracker,
            security,
            discovery,
            sync_engine,
            partition_detector,
            metrics,
        };

        Ok((
            state,
            RunnerChannels {
                change_signal_rx: Some(change_signal_rx),
                reachability_rx: Some(reachability_rx),
            },
        ))
    }

    async fn load_or_bootstrap_identity(
        store: &Arc<SyncStore>,
        config: &Config,
    ) -> anyhow::Result<NodeIdentity> {
        use crate::infrastructure::traits::ChangeStore;

        if let Some(identity) = store.load_identity().await? {
            return Ok(identity);
        }

        let host = local_ip();
        let mut identity = NodeIdentity::new(
            config.sync.node_name.clone(),
            host,
            config.sync.port,
            String::new(),
        );
        identity.registration_key_hash =
            registration_key_hash(&config.security.registration_key, &identity.node_id);
        store.save_identity(&identity).await?;
        Ok(identity)
    }
}

/// Best-effort local LAN address via the UDP-connect trick (no socket is
/// actually opened to the remote host; the kernel just picks a source route).
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
