//! Playguard ingestion pipeline - main entry point
//!
//! Boots the pipeline in dependency order: database, registry,
//! write-ahead log, dedup resolver, detection engine. The WAL replays
//! every non-committed entry from the previous run before any new
//! ingestion is accepted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playguard_common::config::{load_config, resolve_database_path, FileConfig};
use playguard_common::db::init::{init_database, setting_i64};
use playguard_common::events::EventBus;

use playguard_ingest::api;
use playguard_ingest::api::sse::SseBroadcaster;
use playguard_ingest::db::{audit as audit_db, rules as rules_db};
use playguard_ingest::dedup::Resolver;
use playguard_ingest::detect::{self, DetectionEngine};
use playguard_ingest::ingest::Orchestrator;
use playguard_ingest::registry::Registry;
use playguard_ingest::state::{AppState, PipelineSink};
use playguard_ingest::wal::{Wal, WalConfig};

/// Command-line arguments for playguard-ingest
#[derive(Parser, Debug)]
#[command(name = "playguard-ingest")]
#[command(about = "Media telemetry integrity and anomaly-detection pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on (falls back to the config file, then 5760)
    #[arg(short, long, env = "PLAYGUARD_PORT")]
    port: Option<u16>,

    /// Path to the SQLite database
    #[arg(short, long, env = "PLAYGUARD_DB")]
    database: Option<PathBuf>,

    /// Path to the TOML configuration file with declared servers
    #[arg(short, long, env = "PLAYGUARD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playguard_ingest=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => load_config(path).context("Failed to load configuration file")?,
        None => FileConfig::default(),
    };

    let port = args.port.or(file_config.port).unwrap_or(5760);
    let db_path = resolve_database_path(args.database.as_deref(), "PLAYGUARD_DB", Some(&file_config));

    info!("Starting Playguard ingestion pipeline on port {}", port);
    info!("Database: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;
    rules_db::ensure_default_rules(&pool)
        .await
        .context("Failed to install default detection rules")?;

    // Pipeline settings
    let wal_config = WalConfig {
        max_attempts: setting_i64(&pool, "wal_max_attempts", 5).await,
        batch_size: setting_i64(&pool, "wal_batch_size", 64).await,
        ..WalConfig::default()
    };
    let dedup_gap_seconds = setting_i64(&pool, "dedup_gap_seconds", 300).await;
    let restricted_threshold = setting_i64(&pool, "trust_restricted_threshold", 50).await;
    let recovery_amount = setting_i64(&pool, "trust_recovery_per_day", 1).await;
    let recovery_interval = setting_i64(&pool, "trust_recovery_interval_secs", 86_400).await;
    let wal_retention_days = setting_i64(&pool, "wal_retention_days", 7).await;
    let audit_retention_days = setting_i64(&pool, "audit_retention_days", 90).await;

    // Event bus feeding the SSE stream
    let event_bus = EventBus::new(256);

    // Declared servers from configuration, immutable for this process
    let declared = file_config
        .servers
        .into_iter()
        .map(|decl| decl.into_server_config())
        .collect::<playguard_common::Result<Vec<_>>>()
        .context("Invalid declared server configuration")?;

    let registry = Registry::new(pool.clone(), declared, event_bus.clone());
    let wal = Arc::new(Wal::new(pool.clone(), wal_config));
    let resolver = Arc::new(Resolver::new(pool.clone(), dedup_gap_seconds, event_bus.clone()));
    let engine = Arc::new(DetectionEngine::new(
        pool.clone(),
        restricted_threshold,
        event_bus.clone(),
    ));

    let sink = Arc::new(PipelineSink {
        resolver: Arc::clone(&resolver),
        engine: Arc::clone(&engine),
    });

    // Replay uncommitted entries before any new ingestion starts
    wal.replay_pending(sink.as_ref())
        .await
        .context("WAL replay failed")?;

    let orchestrator = Orchestrator::new(Arc::clone(&registry), Arc::clone(&wal), sink);
    orchestrator
        .start_all()
        .await
        .context("Failed to start ingestion workers")?;

    // Trust-score recovery scheduler
    tokio::spawn(detect::run_trust_recovery(
        pool.clone(),
        recovery_amount,
        Duration::from_secs(recovery_interval.max(60) as u64),
        restricted_threshold,
    ));

    // Retention sweeper for committed WAL entries and resolved audit
    // entries
    tokio::spawn(run_retention_sweeper(
        pool.clone(),
        Arc::clone(&wal),
        wal_retention_days,
        audit_retention_days,
    ));

    let app_state = AppState {
        db: pool,
        registry,
        wal,
        resolver,
        engine,
        orchestrator,
        broadcaster: SseBroadcaster::new(event_bus.clone()),
        events: event_bus,
        port,
    };

    let app = api::create_router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Daily retention sweep. Pending WAL entries and unresolved audit
/// entries are never touched.
async fn run_retention_sweeper(
    pool: sqlx::SqlitePool,
    wal: Arc<Wal>,
    wal_retention_days: i64,
    audit_retention_days: i64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match wal.purge_older_than_days(wal_retention_days).await {
            Ok(purged) if purged > 0 => info!(purged, "WAL retention sweep complete"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "WAL retention sweep failed"),
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::days(audit_retention_days.max(1));
        match audit_db::purge_resolved_before(&pool, cutoff).await {
            Ok(purged) if purged > 0 => info!(purged, "audit retention sweep complete"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "audit retention sweep failed"),
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
