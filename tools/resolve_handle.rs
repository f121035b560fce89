//! Operator tool: recover the funding resource handle created by a
//! transaction, or the sequence number of a request, using the same
//! event-log, simulation and scan chain the service runs.

use clap::Parser;
use fairwager::{
    config::ConfigLoader,
    factory::EngineFactory,
    resolver::ScanOutcome,
    types::{Address, RequestId, TxRef},
    WagerResult,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "resolve_handle")]
#[command(about = "Resolve a funding resource handle or request sequence number")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Creation transaction of the funding resource
    #[arg(long, required_unless_present = "request_id")]
    tx: Option<String>,

    /// Owner of the resource; defaults to the configured owner
    #[arg(long)]
    owner: Option<String>,

    /// Scan recent sequence numbers for this request id instead
    #[arg(long, conflicts_with = "tx")]
    request_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fairwager=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{} ({})", e, e.class());
        std::process::exit(1);
    }
}

async fn run(args: Args) -> WagerResult<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let config = loader.load()?;
    let owner = args.owner.as_deref().map(Address::new).unwrap_or_else(|| config.provider.owner());

    let (chain, _) = EngineFactory::collaborators(&config)?;
    let store = EngineFactory::open_store(&fairwager::config::StorageConfig {
        backend: fairwager::config::StorageBackend::Memory,
        data_dir: String::new(),
    })?;
    let engine = EngineFactory::build(config, chain, store)?;

    if let Some(raw) = args.request_id {
        let request_id: RequestId = raw.parse().map_err(|reason| {
            fairwager::errors::ConfigurationError::InvalidValue {
                field: "request-id".to_string(),
                value: raw.clone(),
                reason,
            }
        })?;
        match engine.resolver.sequence_by_scan(&request_id).await? {
            ScanOutcome::Found(sequence) => println!("{}", sequence),
            ScanOutcome::Exhausted => println!("not found"),
            ScanOutcome::LimitReached { probed } => println!("not found in the last {} sequence numbers", probed),
        }
        return Ok(());
    }

    if let Some(tx) = args.tx {
        let resolved = engine.resolver.resolve_handle(&TxRef(tx), &owner).await?;
        println!("{} (via {})", resolved.value, resolved.strategy.label());
    }
    Ok(())
}
