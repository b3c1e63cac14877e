use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub discovery: DiscoveryConfig,
    pub security: SecurityConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub skip_precheck: bool,
    pub precheck_attempts: u32,
    pub precheck_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub node_name: String,
    pub port: u16,
    /// Interval between scheduled per-peer sync cycles, in milliseconds.
    pub interval_ms: u64,
    pub max_batch_size: u32,
    pub data_dir: String,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub network_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub announce_interval_ms: u64,
    pub unreachable_threshold: u32,
    pub transport: DiscoveryTransport,
    pub multicast_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryTransport {
    Multicast,
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Shared out-of-band cluster secret. Empty means the daemon starts in a degraded,
    /// unauthenticated mode — every handshake will fail verification against an empty key.
    pub registration_key: String,
    pub session_lifetime_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_requests: u32,
    pub max_failed_attempts: u32,
    pub encryption_enabled: bool,
    pub signatures_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub consistency_check_cycles: u32,
    pub retention_days: i64,
    pub snapshot_chunk_bytes: usize,
    /// Business tables included in a bulk snapshot export/apply, beyond the
    /// sync engine's own bookkeeping tables.
    pub business_tables: Vec<String>,
}

impl RecoveryConfig {
    /// Each business table paired with its primary-key column, which is
    /// always `id` by convention in this schema.
    pub fn business_table_pairs(&self) -> Vec<(&str, &str)> {
        self.business_tables.iter().map(|t| (t.as_str(), "id")).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let registration_key = env::var("SYNC_REGISTRATION_KEY").unwrap_or_else(|_| {
            tracing::warn!(
                "SYNC_REGISTRATION_KEY not set; starting with an empty registration key, \
                 every peer handshake will fail verification until one is configured"
            );
            String::new()
        });

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:data/sync_daemon.db".to_string()),
                skip_precheck: env::var("SKIP_DB_PRECHECK")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false),
                precheck_attempts: env::var("DB_PRECHECK_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3),
                precheck_base_delay_ms: env::var("DB_PRECHECK_BASE_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            },
            sync: SyncConfig {
                node_name: env::var("SYNC_NODE_NAME").unwrap_or_else(|_| {
                    hostname_fallback()
                }),
                port: env::var("SYNC_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8765),
                interval_ms: env::var("SYNC_INTERVAL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30_000),
                max_batch_size: 100,
                data_dir: env::var("SYNC_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
                backoff_base_ms: 1_000,
                backoff_cap_ms: 5 * 60 * 1_000,
                network_timeout_ms: 10_000,
                shutdown_timeout_ms: 30_000,
            },
            discovery: DiscoveryConfig {
                announce_interval_ms: 10_000,
                unreachable_threshold: 6,
                transport: DiscoveryTransport::Multicast,
                multicast_group: "239.255.42.99".to_string(),
            },
            security: SecurityConfig {
                registration_key,
                session_lifetime_secs: 3600,
                rate_limit_window_secs: 60,
                rate_limit_max_requests: 100,
                max_failed_attempts: 3,
                encryption_enabled: true,
                signatures_enabled: false,
            },
            recovery: RecoveryConfig {
                consistency_check_cycles: 3,
                retention_days: 14,
                snapshot_chunk_bytes: 64 * 1024,
                business_tables: env::var("SYNC_BUSINESS_TABLES")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                    .unwrap_or_default(),
            },
            logging: LoggingConfig {
                level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
        })
    }

    pub fn health_port(&self) -> u16 {
        self.sync.port + 1
    }

    pub fn discovery_port(&self) -> u16 {
        self.sync.port + 1
    }
}

fn hostname_fallback() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "sync-node".to_string())
}
