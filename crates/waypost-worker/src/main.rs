//! Pipeline worker for Waypost.
//!
//! Runs the periodic station and area jobs against `PostgreSQL` and the
//! `Dragonfly` work queues until interrupted.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `waypost.yaml` (or `WAYPOST_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Connect to `Dragonfly`
//! 5. Run the scheduler until Ctrl-C
//! 6. Log the totals and close the pool

mod error;
mod stats_callback;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waypost_core::config::{LoggingConfig, WaypostConfig};
use waypost_core::tasks::{Scheduler, TaskRunner};
use waypost_db::{DragonflyPool, PostgresConfig, PostgresPool};

use crate::error::WorkerError;
use crate::stats_callback::StatsCallback;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "waypost.yaml";

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let (config, config_path) = load_config()?;
    init_logging(&config.logging)?;

    info!(
        config = config_path
            .as_ref()
            .map_or_else(|| "defaults".to_owned(), |p| p.display().to_string()),
        "waypost-worker starting"
    );

    let postgres = PostgresPool::connect(
        &PostgresConfig::new(&config.infrastructure.postgres_url)
            .with_max_connections(config.infrastructure.max_connections),
    )
    .await?;
    postgres.run_migrations().await?;
    let store = Arc::new(postgres.station_store());

    let queue = Arc::new(DragonflyPool::connect(&config.infrastructure.dragonfly_url).await?);

    let runner = TaskRunner::new(store, queue, &config);
    let scheduler = Scheduler::new(runner, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C, stopping");
        }
        info!("Shutdown requested");
        if shutdown_tx.send(true).is_err() {
            warn!("Scheduler already stopped");
        }
    });

    let mut callback = StatsCallback::default();
    let report = scheduler.run(shutdown_rx, &mut callback).await;
    callback.log_totals();

    postgres.close().await;
    info!(
        runs = report.runs,
        failures = report.failures,
        "waypost-worker shutdown complete"
    );
    Ok(())
}

/// Load configuration from `WAYPOST_CONFIG` or `waypost.yaml`.
///
/// A missing file yields the defaults; a file that exists but does not
/// parse is an error.
fn load_config() -> Result<(WaypostConfig, Option<PathBuf>), WorkerError> {
    let path = std::env::var_os("WAYPOST_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        let config = WaypostConfig::from_file(&path)?;
        Ok((config, Some(path)))
    } else {
        let mut config = WaypostConfig::default();
        config.infrastructure.apply_env_overrides();
        Ok((config, None))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level.
fn init_logging(logging: &LoggingConfig) -> Result<(), WorkerError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| WorkerError::Logging {
        message: e.to_string(),
    })
}
