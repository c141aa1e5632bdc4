//! Footsteps Node
//!
//! Runs one peer: UI feed, proof batcher, gossip mesh and verifier.
//! Lobby admission is read from `ADMISSION_*` environment variables.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use footsteps::{
    network::AdmissionConfig, CircuitParameters, Node, NodeConfig, DEFAULT_BATCH_INTERVAL_SECS,
    DEFAULT_REVEAL_RATIO, VERSION,
};

/// Peer-to-peer movement with zero-knowledge path proofs
#[derive(Parser, Debug)]
#[command(name = "footsteps-node", version)]
#[command(about = "Peer-to-peer movement with partial path disclosure", long_about = None)]
struct Args {
    /// Display name of this node
    #[arg(default_value = "node")]
    node_name: String,

    /// UI WebSocket port
    #[arg(long, default_value = "3001")]
    ws_port: u16,

    /// UI bind address
    #[arg(long, default_value = "127.0.0.1")]
    ui_host: IpAddr,

    /// Peer listen port
    #[arg(long, default_value = "9000")]
    p2p_port: u16,

    /// Peer listen address
    #[arg(long, default_value = "0.0.0.0")]
    p2p_host: IpAddr,

    /// Bootstrap peers (host:port, comma separated)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Address other peers should dial to reach this node
    #[arg(long)]
    advertise: Option<String>,

    /// Seconds between batch cuts
    #[arg(long, default_value_t = DEFAULT_BATCH_INTERVAL_SECS)]
    batch_interval: u64,

    /// Fraction of path points revealed per batch
    #[arg(long, default_value_t = DEFAULT_REVEAL_RATIO)]
    reveal_ratio: f64,

    /// Maximum per-axis step
    #[arg(long, default_value = "1")]
    max_step: i32,

    /// Game area half width
    #[arg(long, default_value = "32")]
    half_width: i32,

    /// Game area half height
    #[arg(long, default_value = "32")]
    half_height: i32,

    /// Batch intervals without news before a peer is stale
    #[arg(long, default_value = "3")]
    stale_intervals: u32,

    /// Seconds a stale trail is kept before eviction
    #[arg(long, default_value = "30")]
    eviction_grace: u64,

    /// Failed reconnects before a peer is dropped
    #[arg(long, default_value = "5")]
    max_reconnect_attempts: u32,

    /// Accept a late joiner's chain from the first batch seen
    #[arg(long)]
    lenient_ordering: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        let mut config = NodeConfig {
            node_name: self.node_name,
            params: CircuitParameters {
                max_step: self.max_step,
                half_width: self.half_width,
                half_height: self.half_height,
                reveal_ratio: self.reveal_ratio,
                ..Default::default()
            },
            batch_interval: Duration::from_secs(self.batch_interval),
            stale_after_intervals: self.stale_intervals,
            eviction_grace: Duration::from_secs(self.eviction_grace),
            strict_ordering: !self.lenient_ordering,
            admission: AdmissionConfig::from_env(),
            ..Default::default()
        };
        config.ui.bind_addr = SocketAddr::new(self.ui_host, self.ws_port);
        config.gossip.listen_addr = SocketAddr::new(self.p2p_host, self.p2p_port);
        config.gossip.advertise_addr = self.advertise;
        config.gossip.bootstrap = self.peers.into_iter().filter(|p| !p.trim().is_empty()).collect();
        config.gossip.reconnect.max_attempts = self.max_reconnect_attempts;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Footsteps node v{}", VERSION);

    let config = args.into_config();
    info!("  Node: {}", config.node_name);
    info!("  UI: ws://{}", config.ui.bind_addr);
    info!("  Peers: {} (bootstrap {:?})", config.gossip.listen_addr, config.gossip.bootstrap);
    info!("  Batch interval: {:?}", config.batch_interval);
    if config.gossip.bootstrap.is_empty() {
        info!("  No bootstrap peers; waiting for inbound links");
    }

    let node = Node::new(config).context("invalid configuration")?;
    let shutdown = node.shutdown_handle();
    let running = node.start().await.context("failed to start node")?;
    info!("Peer id {}", running.local_id.to_uuid_string());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                let _ = shutdown.send(());
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    running.wait().await;
    info!("Node stopped");
    Ok(())
}
