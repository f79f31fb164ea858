use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};

use breakwater::config::BreakwaterConfig;
use breakwater::facade::AdmissionController;
use breakwater::store::{CounterStore, MemoryStore, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "breakwater", about = "Adaptive admission control service")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Breakwater Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            info!(path = %path, "Loading configuration");
            BreakwaterConfig::from_file(path)?
        }
        None => {
            info!("No configuration file given, using defaults");
            BreakwaterConfig::default()
        }
    };

    let store: Arc<dyn CounterStore> = match &config.store.redis_url {
        Some(url) => {
            info!(url = %url, "Connecting to Redis counter store");
            let timeout = Duration::from_millis(config.store.call_timeout_ms);
            Arc::new(RedisStore::connect(url, timeout).await?)
        }
        None => {
            info!("No Redis URL configured, using in-memory counter store");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(AdmissionController::new(config, store)?);
    info!("Admission controller initialized");

    let detector = engine.spawn_detector();
    info!("DDoS detector started");

    shutdown_signal().await;

    detector.abort();
    info!("Breakwater Admission Control Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
