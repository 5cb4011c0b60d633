use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use engine_hub::gateways::{SIMULATED_KIND, SimulatedGateway};
use engine_hub::pipeline::{JournalRecord, MemoryRepository};
use engine_hub::server::LoggingCommunicator;
use engine_hub::{ApplicationController, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,engine_hub=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    let path = PathBuf::from(std::env::var("ENGINE_HUB_CONFIG").unwrap_or_else(|_| "config.toml".to_string()));
    let config = if path.exists() {
        Config::load(&path)?
    } else {
        tracing::warn!("{} not found, running with defaults", path.display());
        Config::default()
    };
    tracing::info!(
        "Engine hub '{}' starting with {} provider(s)",
        config.app.name,
        config.providers.len()
    );

    let journal = Arc::new(MemoryRepository::<JournalRecord>::new());
    let controller = ApplicationController::builder(config)
        .kind(SIMULATED_KIND, SimulatedGateway::factory())
        .communicator(Arc::new(LoggingCommunicator))
        .journal(journal.clone())
        .build()?;

    controller.start_server()?;
    tracing::info!("Server running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    controller.stop_server().await?;
    tracing::info!("Journaled {} record(s)", journal.len());
    Ok(())
}
