//! whisper-node - Whisper peer daemon
//!
//! Binds a peer, joins the seeds it is given and logs whatever arrives on the
//! subscribed topics until interrupted.

use std::net::IpAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use whisper_net::{
    Address, GossipConfig, KeepaliveConfig, Message, NodeId, Peer, PeerConfig, parse_seeds,
};

#[derive(Parser)]
#[command(name = "whisper-node")]
#[command(about = "Whisper peer daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peer until Ctrl-C
    Run(RunArgs),

    /// Print a fresh node id
    Id,
}

#[derive(Args)]
struct RunArgs {
    /// Node id (random when omitted)
    #[arg(long, env = "WHISPER_NODE_ID")]
    node_id: Option<NodeId>,

    /// Address to bind
    #[arg(long, env = "WHISPER_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// UDP port (0 picks a free one)
    #[arg(long, env = "WHISPER_PORT", default_value_t = 0)]
    port: u16,

    /// Comma-separated seeds, `<node-id>@<host>:<port>`
    #[arg(long, env = "WHISPER_SEEDS", default_value = "")]
    seeds: String,

    /// Gossip fan-out
    #[arg(long, env = "WHISPER_FANOUT", default_value_t = 5)]
    fanout: usize,

    /// Keepalive interval in seconds (0 disables keepalive)
    #[arg(long, env = "WHISPER_KEEPALIVE_SECS", default_value_t = 1)]
    keepalive_secs: u64,

    /// Topic patterns to log, comma separated
    #[arg(long, env = "WHISPER_SUBSCRIBE", value_delimiter = ',')]
    subscribe: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("whisper_node=info".parse()?)
                .add_directive("whisper_net=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_peer(args).await?,
        Commands::Id => println!("{}", NodeId::new()),
    }

    Ok(())
}

fn peer_config(args: &RunArgs) -> anyhow::Result<PeerConfig> {
    let mut config = PeerConfig::default()
        .with_bind(Address::new(args.host, args.port))
        .with_seeds(parse_seeds(&args.seeds)?)
        .with_gossip(GossipConfig::default().with_fanout(args.fanout));
    if let Some(id) = args.node_id {
        config = config.with_node_id(id);
    }
    if args.keepalive_secs > 0 {
        let interval = Duration::from_secs(args.keepalive_secs);
        config = config.with_keepalive(
            KeepaliveConfig::default()
                .with_interval(interval)
                .with_timeout(interval * 3),
        );
    }
    config.validate()?;
    Ok(config)
}

async fn run_peer(args: RunArgs) -> anyhow::Result<()> {
    let config = peer_config(&args)?;
    let peer = Peer::bind(config).await?;
    info!(dsn = %peer.dsn(), seeds = args.seeds.as_str(), "peer running");
    if !peer.is_advertisable() {
        warn!(host = %args.host, "set --host to a routable address before handing the dsn to other hosts");
    }

    let mut handlers = Vec::with_capacity(args.subscribe.len());
    for pattern in &args.subscribe {
        let handler = peer.subscribe(pattern, |message: Message| async move {
            info!(
                id = %message.id,
                topic = %message.topic,
                src = ?message.routing.src,
                payload = %String::from_utf8_lossy(&message.payload),
                "received"
            );
            Ok(None)
        })?;
        info!(pattern = %pattern, "subscribed");
        handlers.push(handler);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    peer.disconnect().await;
    Ok(())
}
