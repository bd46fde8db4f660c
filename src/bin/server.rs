//! # Chat Server Binary
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin server -- server_a --config config/cluster.toml
//! ```
//!
//! The server will:
//! 1. Load its persisted users, channels, and logs from `<data_dir>/<name>/`
//! 2. Register with the reference service and obtain a rank
//! 3. Attach to the router and subscribe to coordinator and replication topics
//! 4. Serve chat requests and replicate every mutation to its peers

use clap::Parser;
use rand::Rng;

use chat_cluster::common::logging::init_logger;
use chat_cluster::{ChatServerMiddleware, ClusterConfig};

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server name; a random `server_NNNN` name is used when omitted
    name: Option<String>,

    /// Path to the cluster configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the storage root directory
    #[arg(long, env = "CHAT_DATA_DIR")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let mut config = ClusterConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir.into();
    }

    let name = args
        .name
        .unwrap_or_else(|| format!("server_{}", rand::thread_rng().gen_range(1000..10000)));

    let middleware = ChatServerMiddleware::new(config, name)?;
    middleware.run().await;

    Ok(())
}
