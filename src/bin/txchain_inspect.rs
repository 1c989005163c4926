//! txchain-inspect: print what the coordination store knows about
//! transactions.
//!
//! ## Usage
//! ```text
//! txchain-inspect [--config <path>] [--yaml] <transaction-id>...
//! ```
//!
//! ## Configuration
//! - TXCHAIN_CONFIG: Path to config file (default: txchain.yaml)
//! - TXCHAIN__MEDIATOR, TXCHAIN__GROUP, TXCHAIN__PEER: Overrides
//! - TXCHAIN_LOG: Log filter (default: info)
//!
//! The lease reaper is not started.

use clap::Parser;
use tracing::{info, warn};

use txchain::utils::bootstrap::init_tracing;
use txchain::{Coordinator, MediatorClient, TxConfig};

/// Print the chain and decision of distributed transactions.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Config file, layered over txchain.yaml
    #[clap(short, long)]
    config: Option<String>,

    /// Print each result as YAML
    #[clap(long)]
    yaml: bool,

    /// Transaction ids to look up
    #[clap(required = true)]
    ids: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = Args::parse();
    let mut config = TxConfig::load(args.config.as_deref())?;
    config.lease.ttl_secs = 0;

    let coordinator = Coordinator::connect(config).await?;
    info!(transactions = args.ids.len(), "txchain-inspect connected");

    for id in &args.ids {
        match coordinator.mediator().transaction_result(id).await {
            Ok(Some(result)) if args.yaml => print!("{}", serde_yaml::to_string(&result)?),
            Ok(Some(result)) => println!("{}", result),
            Ok(None) => println!("{}: not found", id),
            Err(e) => warn!(transaction_id = %id, error = %e, "Failed to read transaction"),
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
