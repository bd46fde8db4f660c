//! # Router Binary
//!
//! ```bash
//! cargo run --bin router -- --config config/cluster.toml
//! ```
//!
//! Clients connect to `router_frontend`, chat servers to `router_backend`.

use clap::Parser;

use chat_cluster::common::logging::init_logger;
use chat_cluster::relay::router;
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

    router::run(&config).await
}
