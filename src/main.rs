// Peer-to-peer sync daemon — the Service Runner (§2, §5, §6).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sync_daemon::{
    app_state::AppState,
    config::Config,
    infrastructure::{monitoring, store::SyncStore},
};

const EXIT_OK: i32 = 0;
const EXIT_CONFIGURATION_ERROR: i32 = 1;
const EXIT_DB_PRECHECK_FAILED: i32 = 2;
const EXIT_IDENTITY_FAILED: i32 = 3;
const EXIT_FATAL: i32 = 4;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(EXIT_CONFIGURATION_ERROR);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("fatal during steady state: {}", e);
        std::process::exit(EXIT_FATAL);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    if !config.database.skip_precheck {
        if let Err(e) = database_precheck(&config).await {
            error!("database precheck failed after all retries: {}", e);
            std::process::exit(EXIT_DB_PRECHECK_FAILED);
        }
    }

    let (state, channels) = match AppState::new(config.clone()).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("identity initialization failed: {}", e);
            std::process::exit(EXIT_IDENTITY_FAILED);
        }
    };

    info!(
        node_id = %state.identity.node_id,
        node_name = %state.identity.node_name,
        "starting sync daemon"
    );

    // C1 is already live (ClockIdentity::load happened during AppState::new).
    // C2: drive local-change signals into C5.
    if let Some(change_signal_rx) = channels.change_signal_rx {
        let engine = state.sync_engine.clone();
        tokio::spawn(engine.run_triggered_by_local_events(change_signal_rx));
    }

    // C4: start discovery before C5/C6, which both depend on its peer inventory.
    state.discovery.start().await?;

    // C5: per-peer replication scheduler and inbound server.
    state.sync_engine.start(config.sync.port).await?;

    // C6: reachability watcher, consistency sweep, retention sweep.
    if let Some(reachability_rx) = channels.reachability_rx {
        tokio::spawn(
            state
                .partition_detector
                .clone()
                .run_reachability_watcher(reachability_rx),
        );
    }
    tokio::spawn(state.partition_detector.clone().run_consistency_sweep());
    tokio::spawn(state.partition_detector.clone().run_retention_sweep());

    // Session/audit sweeper.
    let security = state.security.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = security.sweep_expired_sessions().await {
                warn!("session sweep failed: {}", e);
            }
        }
    });

    state.metrics.mark_running();

    let health_router = monitoring::router(state.metrics.clone());
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port()));
    let listener = TcpListener::bind(health_addr).await?;
    info!(addr = %health_addr, "health endpoint listening");

    let shutdown_metrics = state.metrics.clone();
    axum::serve(listener, health_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, stopping");
    shutdown_metrics.mark_stopped();

    let shutdown = async {
        // Reverse of startup order: health endpoint is already down (axum::serve
        // returned), recovery sessions and in-flight sync cycles drain on their
        // own next tick, discovery simply stops being polled, and the clock's
        // state is already durable after every `tick`/`merge` call.
        info!("sync daemon stopped");
    };

    if tokio::time::timeout(Duration::from_millis(config.sync.shutdown_timeout_ms), shutdown)
        .await
        .is_err()
    {
        warn!("graceful shutdown timed out, forcing exit");
    }

    std::process::exit(EXIT_OK);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Retries `SyncStore::new` with exponential backoff (`baseDelay × 2^attempt`)
/// before giving up (§5 Timeouts, §6 exit codes).
async fn database_precheck(config: &Config) -> anyhow::Result<()> {
    let mut attempt = 0u32;
    loop {
        match SyncStore::new(&config.database.url).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt + 1 >= config.database.precheck_attempts => {
                return Err(anyhow::anyhow!(e));
            }
            Err(e) => {
                let delay = Duration::from_millis(
                    config.database.precheck_base_delay_ms * (1u64 << attempt),
                );
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "database precheck attempt failed: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
