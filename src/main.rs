//! Palisade tenant-security middleware.
//!
//! Main entry point for the palisade server. Initializes all subsystems,
//! schedules the key rotation sweep and coordinates graceful startup and
//! shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use palisade_api::{shutdown_signal, start_server, AppState, Config};
use palisade_core::{Clock, RealClock, Storage};
use palisade_crypto::{
    ColumnEncryptionEngine, EncryptedColumnStore, EnvKeyRegistry, KeyRegistry,
    PgEncryptedColumnStore, RotationSweep,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting palisade tenant-security middleware");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        rate_limit_failure_mode = %config.rate_limit_failure_mode,
        audit_mode = %config.audit_mode,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    palisade_core::storage::migrate(&db_pool).await.context("Failed to run migrations")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));
    let state = AppState::from_config(&config, storage.clone(), clock)?;
    let addr = config.parse_server_addr()?;

    let cancel = CancellationToken::new();

    let sweep_handle = match config.rotation_sweep_interval() {
        Some(interval) => {
            let sweeps = build_sweeps(&config, &storage)?;
            info!(
                interval_secs = interval.as_secs(),
                targets = sweeps.len(),
                "Scheduling key rotation sweep"
            );
            Some(tokio::spawn(run_rotation_schedule(sweeps, interval, cancel.clone())))
        },
        None => {
            info!("Key rotation sweep disabled");
            None
        },
    };

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    };

    info!(addr = %addr, "palisade is ready to receive requests");

    if let Err(e) = start_server(state, addr, shutdown).await {
        error!(error = %e, "Server failed");
        cancel.cancel();
    }

    if let Some(handle) = sweep_handle {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                warn!("Rotation sweep did not stop within the grace period");
            },
            _ = handle => {
                info!("Rotation sweep stopped");
            },
        }
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("palisade shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info,palisade=debug,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// One sweep per configured encrypted column, all sharing one registry.
fn build_sweeps(config: &Config, storage: &Storage) -> Result<Vec<RotationSweep>> {
    let registry: Arc<dyn KeyRegistry> =
        Arc::new(EnvKeyRegistry::from_env().context("Failed to read key registry")?);
    let engine = ColumnEncryptionEngine::new(registry).with_key_timeout(config.store_timeout());

    let sweeps = config
        .column_targets()?
        .into_iter()
        .map(|target| {
            let store: Arc<dyn EncryptedColumnStore> =
                Arc::new(PgEncryptedColumnStore::new(storage.pool(), target));
            RotationSweep::new(engine.clone(), store)
                .with_batch_size(config.rotation_batch_size)
                .with_concurrency(config.rotation_concurrency)
        })
        .collect();

    Ok(sweeps)
}

/// Sweeps every resolvable non-current version off each column on every
/// tick until cancelled.
async fn run_rotation_schedule(
    sweeps: Vec<RotationSweep>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }

        for sweep in &sweeps {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = sweep_stale_versions(sweep, &cancel).await {
                warn!(error = %e, "Rotation sweep pass failed");
            }
        }
    }

    info!("Rotation schedule stopped");
}

async fn sweep_stale_versions(
    sweep: &RotationSweep,
    cancel: &CancellationToken,
) -> palisade_crypto::Result<()> {
    let registry = sweep.engine().registry();
    let current = registry.current_version().await?;

    for version in registry.resolvable_versions().await? {
        if version == current || cancel.is_cancelled() {
            continue;
        }
        let report = sweep.run(&version, cancel.clone()).await?;
        if !report.is_complete() {
            warn!(
                version = %version,
                conflicts = report.conflicts,
                failed = report.failed,
                cancelled = report.cancelled,
                "Rotation sweep left rows behind"
            );
        }
    }

    Ok(())
}
