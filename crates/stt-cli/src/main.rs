//! STT Protocol CLI
//!
//! Secure Transit Transport

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stt_core::{NodeConfig, SttNode};
use stt_discovery::RelayServer;

/// STT - secure stream multiplexing over UDP
#[derive(Parser)]
#[command(name = "stt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Node {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port (0 picks a free port)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Chamber directory for persistent key/session storage
        #[arg(long)]
        chamber: Option<PathBuf>,

        /// Node seed (hex). Generated randomly when omitted.
        #[arg(long)]
        node_seed: Option<String>,

        /// Pre-shared network seed (hex)
        #[arg(long)]
        shared_seed: String,

        /// Announce on the LAN discovery channel
        #[arg(long)]
        discover: bool,

        /// Peer to connect to on startup, as host:port
        #[arg(long)]
        connect: Option<String>,
    },

    /// Run a relay rendezvous server
    Relay {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port
        #[arg(long, default_value_t = 9000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    match cli.command {
        Commands::Node {
            host,
            port,
            chamber,
            node_seed,
            shared_seed,
            discover,
            connect,
        } => {
            run_node(host, port, chamber, node_seed, shared_seed, discover, connect).await
        }
        Commands::Relay { host, port } => run_relay(host, port).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node(
    host: String,
    port: u16,
    chamber: Option<PathBuf>,
    node_seed: Option<String>,
    shared_seed: String,
    discover: bool,
    connect: Option<String>,
) -> anyhow::Result<()> {
    let node_seed = match node_seed {
        Some(hex_seed) => hex::decode(hex_seed)?,
        None => {
            use rand::RngCore;
            let mut seed = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            seed
        }
    };
    let shared_seed = hex::decode(shared_seed)?;
    anyhow::ensure!(shared_seed.len() >= 16, "shared seed must be at least 16 bytes");

    let config = NodeConfig {
        host,
        port,
        chamber_path: chamber,
        enable_discovery: discover,
        ..NodeConfig::default()
    };
    let node = SttNode::new(&node_seed, &shared_seed, config);
    let addr = node.start().await?;

    println!("node id:  {}", hex::encode(node.node_id()));
    println!("listening on {addr}");

    if let Some(peer) = connect {
        let (peer_host, peer_port) = peer
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--connect expects host:port"))?;
        let session = node.connect(peer_host, peer_port.parse()?).await?;
        let session_id = session.lock().await.session_id();
        println!("session established: {}", hex::encode(session_id));
    }

    tokio::signal::ctrl_c().await?;
    println!();

    let stats = node.stats().await;
    println!("sessions: {}", stats.sessions);
    if let Some(transport) = &stats.transport {
        println!(
            "traffic:  {} packets / {} bytes out, {} packets / {} bytes in",
            transport.packets_sent,
            transport.bytes_sent,
            transport.packets_received,
            transport.bytes_received
        );
    }
    node.stop().await;
    Ok(())
}

async fn run_relay(host: String, port: u16) -> anyhow::Result<()> {
    let server = RelayServer::new(host, port);
    let addr = server.start().await?;
    println!("relay listening on {addr}");

    tokio::signal::ctrl_c().await?;
    println!();

    let stats = server.stats();
    println!(
        "registrations: {} active, {} announces, {} lookups, {} evictions",
        stats.registered_nodes, stats.announces, stats.lookups, stats.evictions
    );
    server.stop().await;
    Ok(())
}
