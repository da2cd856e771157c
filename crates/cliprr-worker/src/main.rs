//! Processing worker binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cliprr_store::{Database, SettingsStore};
use cliprr_worker::{RecoverySupervisor, WorkerConfig, WorkerContext, WorkerPool};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("cliprr=info".parse().expect("valid directive")),
        )
        .init();

    info!("starting cliprr-worker");

    // External tools are a hard requirement; fail fast with their paths.
    match cliprr_media::check_tools() {
        Ok(paths) => {
            for path in paths {
                info!(tool = %path.display(), "external tool found");
            }
        }
        Err(e) => {
            error!("startup check failed: {e}");
            std::process::exit(1);
        }
    }

    let database = match Database::connect(&cliprr_worker::config::default_database_url()).await {
        Ok(db) => db,
        Err(e) => {
            error!("failed to open database: {e}");
            std::process::exit(1);
        }
    };

    let settings = SettingsStore::new(database.pool().clone());
    let config = match WorkerConfig::load(&settings).await {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(?config, "worker configured");

    let ctx = match WorkerContext::new(config, &database) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to build worker context: {e}");
            std::process::exit(1);
        }
    };

    // Recovery runs at startup and on its own cadence.
    let supervisor = RecoverySupervisor::new(Arc::clone(&ctx));
    let recovery_handle = tokio::spawn(async move { supervisor.run().await });

    // Ctrl-c flips the shared shutdown signal.
    let signal_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            signal_ctx.shutdown();
        }
    });

    let pool = WorkerPool::new(Arc::clone(&ctx));
    if let Err(e) = pool.run().await {
        error!("worker pool error: {e}");
        std::process::exit(1);
    }

    recovery_handle.abort();
    info!("worker shutdown complete");
}
