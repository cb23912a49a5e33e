use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::rpc::message::NodeId;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port format, supports both IP and hostnames
}

/// Startup configuration for one cluster member. Read once; there is no
/// hot-reload.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound (inclusive) of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Period between leader heartbeats.
    pub heartbeat_interval_ms: u64,
    /// A follower considers its leader lost once this much time passes
    /// without a heartbeat. Must exceed `heartbeat_interval_ms`.
    pub heartbeat_timeout_ms: u64,
    /// Deadline for a single peer RPC.
    pub rpc_timeout_ms: u64,
    /// Fixed delay between reconnect attempts to a peer.
    pub reconnect_backoff_ms: u64,
    /// Where to serve the HTTP status page, if anywhere.
    pub status_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 150,
            rpc_timeout_ms: 100,
            reconnect_backoff_ms: 200,
            status_addr: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig::new(self.peers.iter().map(|p| p.node_id).collect())
    }

    /// Reject configurations the election protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.peers.len() < 2 {
            return Err(RaftError::Config(format!(
                "a cluster needs at least 3 nodes, got {}",
                self.peers.len() + 1
            )));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(RaftError::Config(format!(
                    "peer list contains this node ({})",
                    self.node_id
                )));
            }
            if !seen.insert(peer.node_id) {
                return Err(RaftError::Config(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::Config(format!(
                "invalid election timeout range {}..={}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(RaftError::Config(
                "heartbeat interval and rpc timeout must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(RaftError::Config(format!(
                "heartbeat timeout ({}ms) must exceed heartbeat interval ({}ms)",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

/// Static cluster membership as seen from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub peers: Vec<NodeId>,
    pub node_count: usize,
}

impl ClusterConfig {
    pub fn new(peers: Vec<NodeId>) -> Self {
        let node_count = peers.len() + 1; // peers + self
        Self { peers, node_count }
    }

    /// Votes needed to win an election: `floor(n/2) + 1`.
    pub fn majority(&self) -> usize {
        self.node_count / 2 + 1
    }
}
