//! # Chat Client Binary
//!
//! One-shot commands sent through the router, plus a bus listener.
//!
//! ```bash
//! cargo run --bin client -- login alice
//! cargo run --bin client -- channel general
//! cargo run --bin client -- publish alice general "hello"
//! cargo run --bin client -- message alice bob "hi bob"
//! cargo run --bin client -- listen general bob
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use chat_cluster::client::{RequestClient, Subscriber};
use chat_cluster::common::logging::init_logger;
use chat_cluster::common::messages::{payload_clock, RequestData};
use chat_cluster::{ClusterConfig, LogicalClock, Request};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the cluster configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a login for USER
    Login { user: String },
    /// List known users
    Users,
    /// Create a channel
    Channel { channel: String },
    /// List channels
    Channels,
    /// Post MESSAGE to CHANNEL as USER
    Publish {
        user: String,
        channel: String,
        message: String,
    },
    /// Send a private message
    Message {
        src: String,
        dst: String,
        message: String,
    },
    /// Print bus publications whose topic starts with any of TOPICS
    Listen {
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

impl Command {
    /// Service name and request data for the one-shot commands.
    fn into_request(self) -> Option<(&'static str, RequestData)> {
        let request = match self {
            Command::Login { user } => (
                "login",
                RequestData {
                    user: Some(user),
                    ..RequestData::default()
                },
            ),
            Command::Users => ("users", RequestData::default()),
            Command::Channel { channel } => (
                "channel",
                RequestData {
                    channel: Some(channel),
                    ..RequestData::default()
                },
            ),
            Command::Channels => ("channels", RequestData::default()),
            Command::Publish {
                user,
                channel,
                message,
            } => (
                "publish",
                RequestData {
                    user: Some(user),
                    channel: Some(channel),
                    message: Some(message),
                    ..RequestData::default()
                },
            ),
            Command::Message { src, dst, message } => (
                "message",
                RequestData {
                    src: Some(src),
                    dst: Some(dst),
                    message: Some(message),
                    ..RequestData::default()
                },
            ),
            Command::Listen { .. } => return None,
        };
        Some(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let args = Args::parse();
    let config = ClusterConfig::load(args.config.as_deref())?;
    let mut clock = LogicalClock::new();

    if let Command::Listen { topics } = &args.command {
        return listen(&config, topics, &mut clock).await;
    }

    let Some((service, data)) = args.command.into_request() else {
        return Ok(());
    };

    let mut client = RequestClient::new(
        config.endpoints.router_frontend.clone(),
        config.timing.request_timeout(),
    );
    let request = Request::new(service, data, clock.tick());
    let response = client.request(&request).await?;
    clock.observe(response.data.clock);

    info!("[Clock={}] Reply to {}", clock.time(), response.service);
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

async fn listen(config: &ClusterConfig, topics: &[String], clock: &mut LogicalClock) -> Result<()> {
    let mut subscriber = Subscriber::connect(&config.endpoints.bus_subscribe, topics).await?;
    info!("📡 Listening on {:?}", topics);

    while let Some((topic, payload)) = subscriber.recv().await? {
        clock.observe(payload_clock(&payload));
        println!("[{}] {} (clock {})", topic, payload, clock.time());
    }
    Ok(())
}
