//! LAYOFF — Bet exposure & transfer-out ledger engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the configured store, and serves the API until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use layoff::api;
use layoff::config::{self, StorageBackend};
use layoff::engine::TransferDesk;
use layoff::storage::{LedgerStore, MemoryStore, SqliteStore};

const BANNER: &str = r#"
 _        _ __   __ ___   _____ _____
| |      / \\ \ / // _ \ |  ___|  ___|
| |     / _ \\ V /| | | || |_  | |_
| |___ / ___ \| | | |_| ||  _| |  _|
|_____/_/   \_\_|  \___/ |_|   |_|

  Bet exposure & transfer-out ledger
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("LAYOFF_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        backend = ?cfg.storage.backend,
        upstream_timeout_ms = cfg.engine.upstream_timeout_ms,
        linked_failure_policy = %cfg.engine.linked_failure_policy,
        "LAYOFF starting up"
    );

    // -- Store -----------------------------------------------------------

    let store: Arc<dyn LedgerStore> = match cfg.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::connect(&cfg.storage.database_url)
                .await
                .with_context(|| format!("Failed to open database {}", cfg.storage.database_url))?,
        ),
    };

    let desk = Arc::new(TransferDesk::new(store, cfg.desk_settings()));

    // -- Serve -----------------------------------------------------------

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received.");
    };

    if cfg.api.enabled {
        info!(port = cfg.api.port, "Press Ctrl+C to stop.");
        api::serve(desk, cfg.api.port, shutdown).await?;
    } else {
        info!("API disabled; idling until Ctrl+C.");
        shutdown.await;
    }

    info!("LAYOFF shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("layoff=info"));

    let json_logging = std::env::var("LAYOFF_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
