//! # Reference Service Binary
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin reference -- --config config/cluster.toml
//! ```
//!
//! Assigns ranks, tracks heartbeats, and announces the coordinator on the bus.

use clap::Parser;

use chat_cluster::client::Publisher;
use chat_cluster::common::logging::init_logger;
use chat_cluster::{ClusterConfig, ReferenceService};

/// Command-line arguments for the reference service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the cluster configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config = ClusterConfig::load(args.config.as_deref())?;

    let publisher = Publisher::connect(config.endpoints.bus_publish.clone());
    let service = ReferenceService::new(config, publisher);

    service.run().await
}
