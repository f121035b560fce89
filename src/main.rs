//! Fairwager settlement service
//!
//! Loads configuration, brings up the funding resource, then runs the
//! background workers and the HTTP API until shutdown.

use clap::Parser;
use fairwager::{
    api::{server::shutdown_signal, ApiServer},
    config::{generate_sample_config, ChainMode, ConfigLoader},
    factory::EngineFactory,
    workers::{WorkerIntervals, Workers},
    WagerResult,
};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Provably fair randomness and treasury settlement
#[derive(Parser)]
#[command(name = "fairwager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the in-process chain instead of the RPC endpoint
    #[arg(long)]
    simulate: bool,

    /// Write a sample configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    write_sample_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.write_sample_config {
        init_tracing("info");
        match generate_sample_config(&path.to_string_lossy()) {
            Ok(()) => info!(path = %path.display(), "Sample configuration written"),
            Err(e) => {
                error!(error = %e, "Could not write sample configuration");
                std::process::exit(1);
            }
        }
        return;
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    if cli.simulate {
        loader = loader.with_mode(ChainMode::Simulated);
    }
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the file, so report on stderr.
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let filter = if cli.verbose { "fairwager=debug,tower_http=debug" } else { config.monitoring.log_filter.as_str() };
    init_tracing(filter);

    if let Err(e) = run(config).await {
        error!(error = %e, class = %e.class(), "Service stopped with an error");
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();
}

async fn run(config: fairwager::WagerConfig) -> WagerResult<()> {
    info!(mode = ?config.provider.mode, backend = ?config.storage.backend, "Starting fairwager");

    let store = EngineFactory::open_store(&config.storage)?;
    let (chain, simulated) = EngineFactory::collaborators(&config)?;
    if simulated.is_some() {
        warn!("Simulated chain in use; nothing is settled on a real network");
    }
    let engine = EngineFactory::build(config, chain, store)?;

    let handle = engine
        .subscriptions
        .bootstrap(engine.config.provider.subscription_handle)
        .await?;
    info!(handle, consumer = %engine.subscriptions.consumer_contract(), "Funding resource ready");

    let workers = Workers::spawn(
        engine.coordinator.clone(),
        engine.ledger.clone(),
        WorkerIntervals::from_config(&engine.config),
    );

    if engine.config.api.enabled {
        let server = ApiServer::new(engine.config.api.clone(), &engine);
        if let Err(e) = server.run().await {
            error!(error = %e, "API server failed");
        }
    } else {
        info!("API disabled, running workers only");
        shutdown_signal().await;
    }

    workers.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
