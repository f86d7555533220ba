//! # AniDB Mirror Main Driver
//!
//! ## Purpose
//! Main entry point for the mirror daemon. Orchestrates initialization of
//! all components, runs startup reconciliation, and supervises the
//! background fetch worker until shutdown.
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging and tracing
//! 3. Open the persistent store and heal partial writes (reconciliation)
//! 4. Initialize quota tracker, fetch queue, and cache manager
//! 5. Spawn the fetch worker and the periodic reconciliation task
//! 6. Handle shutdown signals gracefully (persist quota, flush store)

use clap::{Arg, Command};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use anidb_mirror::{
    config::Config,
    errors::{MirrorError, Result},
    manager::CacheManager,
    queue::JobQueue,
    quota::QuotaTracker,
    storage::Store,
    upstream::AniDbClient,
    worker::FetchWorker,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("anidb-mirror")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Durable caching mirror for AniDB anime metadata")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("db-path")
                .long("db-path")
                .value_name("DIR")
                .help("Database directory override"),
        )
        .arg(
            Arg::new("reconcile")
                .long("reconcile")
                .help("Run a reconciliation pass and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-health")
                .long("check-health")
                .help("Run health checks, print stats, and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = Config::from_file(config_path)?;
    if let Some(db_path) = matches.get_one::<String>("db-path") {
        config.storage.db_path = db_path.into();
    }

    init_logging(&config);

    info!("Starting AniDB mirror v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Quota {}/day, throttle {}s, staleness threshold {} days",
        config.fetcher.daily_limit,
        config.fetcher.throttle_seconds,
        config.fetcher.staleness_threshold_days
    );

    let store = Arc::new(Store::open(config.storage.clone()).await?);

    let today = chrono::Utc::now().date_naive();
    let quota = Arc::new(Mutex::new(QuotaTracker::new(
        config.fetcher.daily_limit,
        store.load_quota()?,
        today,
    )));
    let queue = Arc::new(JobQueue::new());
    let halted = Arc::new(AtomicBool::new(false));
    let manager = CacheManager::new(
        store.clone(),
        queue.clone(),
        quota.clone(),
        halted.clone(),
        &config.fetcher,
        &config.search,
    );

    if matches.get_flag("check-health") {
        store.health_check().await?;
        let stats =
            serde_json::to_string_pretty(&manager.stats()).map_err(|e| MirrorError::Internal {
                message: format!("Failed to serialize stats: {}", e),
            })?;
        println!("{}", stats);
        info!("All health checks passed");
        return Ok(());
    }

    // Startup reconciliation heals partial writes from a previous run.
    let report = manager.reconcile().await?;
    if report.healed > 0 || report.parse_failures > 0 || report.dangling_rows > 0 {
        info!(
            "Startup reconciliation: {} scanned, {} healed, {} unparseable, {} dangling rows",
            report.scanned, report.healed, report.parse_failures, report.dangling_rows
        );
    }

    if matches.get_flag("reconcile") {
        info!("Reconciliation pass complete, exiting");
        return Ok(());
    }

    let client = Arc::new(AniDbClient::new(config.upstream.clone())?);
    let worker = FetchWorker::new(
        client,
        store.clone(),
        queue.clone(),
        quota.clone(),
        halted.clone(),
        config.fetcher.clone(),
    );
    let mut worker_handle = tokio::spawn(worker.run());

    let reconcile_handle = spawn_periodic_reconcile(
        manager.clone(),
        config.fetcher.reconcile_interval_hours,
    );

    info!(
        "AniDB mirror ready: {} anime cached, quota {}/{}",
        manager.stats().cached_anime,
        manager.stats().quota_used,
        manager.stats().daily_limit
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = &mut worker_handle => {
            warn!("Fetch worker stopped");
        }
    }

    reconcile_handle.abort();
    worker_handle.abort();

    // Persist the quota snapshot and flush pending writes. An abandoned
    // in-flight fetch is safe: raw-before-index ordering plus startup
    // reconciliation guarantees no corrupt partial state.
    let snapshot = quota.lock().snapshot(chrono::Utc::now().date_naive());
    store.save_quota(&snapshot)?;
    store.flush().await?;

    info!("AniDB mirror shut down successfully");
    Ok(())
}

/// Initialize logging and tracing
fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json_format {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Spawn the periodic reconciliation task
fn spawn_periodic_reconcile(
    manager: CacheManager,
    interval_hours: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_secs(interval_hours.max(1) * 3600);
        let mut ticker = tokio::time::interval(period);
        // The immediate first tick duplicates startup reconciliation.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match manager.reconcile().await {
                Ok(report) if report.healed > 0 => {
                    info!("Periodic reconciliation healed {} entries", report.healed);
                }
                Ok(_) => {}
                Err(e) => warn!("Periodic reconciliation failed: {}", e),
            }
        }
    })
}
