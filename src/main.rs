use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use raft_election::config::{NodeConfig, PeerConfig};
use raft_election::node::Node;
use raft_election::rpc::message::VoteRequest;
use raft_election::rpc::{RaftService, RpcClient};
use raft_election::scope::TaskScope;
use raft_election::shutdown::install_shutdown_handler;
use raft_election::storage::MemoryLogStore;
use raft_election::{NodeId, RaftError};

#[derive(Parser, Debug)]
#[command(name = "raft-election")]
#[command(version)]
#[command(about = "Raft leader election over a JSON-line RPC transport")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a cluster member
    Server(ServerArgs),

    /// Ask a running node for its current term
    Probe(ProbeArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port for peer RPC traffic
    #[arg(long, default_value = "7001")]
    port: u16,

    /// Peer addresses (format: id:host:port,id:host:port)
    #[arg(long, default_value = "")]
    peers: String,

    /// Port for the HTTP status page (disabled if not set)
    #[arg(long)]
    status_port: Option<u16>,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Interval between leader heartbeats
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Silence after which a follower considers the leader lost
    #[arg(long, default_value = "150")]
    heartbeat_timeout_ms: u64,

    /// Deadline for a single peer RPC
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,

    /// Pause between attempts to reconnect to an unreachable peer
    #[arg(long, default_value = "200")]
    reconnect_backoff_ms: u64,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Node address (host:port)
    #[arg(long, short = 'a', default_value = "127.0.0.1:7001")]
    addr: String,

    /// How long to wait for the node to answer
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

#[derive(Serialize)]
struct ProbeOutput {
    addr: String,
    term: u64,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let peer = peer.trim();
            let (id, addr) = peer.split_once(':')?;
            let node_id = match id.parse() {
                Ok(id) => NodeId(id),
                Err(_) => {
                    tracing::warn!(peer, "Invalid peer id, expected id:host:port");
                    return None;
                }
            };
            if addr.rsplit_once(':').is_none() {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                return None;
            }
            Some(PeerConfig {
                node_id,
                addr: addr.to_string(),
            })
        })
        .collect()
}

// =============================================================================
// Commands
// =============================================================================

impl ServerArgs {
    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            node_id: NodeId(self.node_id),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], self.port)),
            peers: parse_peers(&self.peers),
            election_timeout_min_ms: self.election_timeout_min_ms,
            election_timeout_max_ms: self.election_timeout_max_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            rpc_timeout_ms: self.rpc_timeout_ms,
            reconnect_backoff_ms: self.reconnect_backoff_ms,
            status_addr: self
                .status_port
                .map(|p| SocketAddr::from(([0, 0, 0, 0], p))),
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.node_config();

    tracing::info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        status_addr = ?config.status_addr,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting raft-election node"
    );

    let node = Node::new(config, Arc::new(MemoryLogStore::new()))?;
    let shutdown = install_shutdown_handler()?;
    node.run(shutdown).await?;
    Ok(())
}

/// A pre-vote is always denied and changes nothing on the remote node, so it
/// doubles as a read-only term query.
async fn run_probe(args: ProbeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let scope = TaskScope::new();
    let client = RpcClient::connect(
        NodeId(0),
        args.addr.clone(),
        timeout,
        Duration::from_millis(100),
        &scope,
    );

    let deadline = tokio::time::Instant::now() + timeout;
    let result = loop {
        let request = VoteRequest {
            term: 0,
            candidate_id: NodeId(0),
            last_log_index: 0,
        };
        match client.request_pre_vote(request).await {
            Err(RaftError::ConnectionLost) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => break other,
        }
    };
    scope.shutdown().await;

    let response = result?;
    let output = ProbeOutput {
        addr: args.addr,
        term: response.term,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Probe(probe_args) => run_probe(probe_args).await?,
    }

    Ok(())
}
