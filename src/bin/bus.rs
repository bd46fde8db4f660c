//! # Bus Binary
//!
//! ```bash
//! cargo run --bin bus -- --config config/cluster.toml
//! ```
//!
//! Publishers connect to `bus_publish`, subscribers to `bus_subscribe`.

use clap::Parser;

use chat_cluster::common::logging::init_logger;
use chat_cluster::relay::bus;
use chat_cluster::ClusterConfig;

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

    bus::run(&config).await
}
