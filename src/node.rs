use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::raft::RaftNode;
use crate::rpc::server::RpcServer;
use crate::scope::TaskScope;
use crate::status::run_status_server;
use crate::storage::LogStore;

/// Main node that wires the consensus core to the network
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
}

impl Node {
    /// Build a node from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Config`](crate::RaftError::Config) if the
    /// configuration cannot support an election.
    pub fn new(config: NodeConfig, storage: Arc<dyn LogStore>) -> Result<Self> {
        config.validate()?;
        let raft_node = RaftNode::new(config.clone(), storage);
        Ok(Self { config, raft_node })
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Binds the RPC server so peers can reach this node
    /// 2. Starts connecting to every peer in the background
    /// 3. Arms the election timer
    /// 4. Optionally serves the HTTP status page
    ///
    /// # Errors
    ///
    /// Returns an error if the RPC or status listener cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let scope = self.raft_node.scope().clone();

        if let Err(e) = self.start(&scope).await {
            self.raft_node.close().await;
            return Err(e);
        }

        shutdown.cancelled().await;
        tracing::info!(node_id = %self.config.node_id, "Shutdown requested, stopping node");
        self.raft_node.close().await;
        Ok(())
    }

    async fn start(&self, scope: &TaskScope) -> Result<()> {
        let server = RpcServer::bind(self.config.listen_addr, self.raft_node.clone(), scope).await?;
        tracing::info!(
            node_id = %self.config.node_id,
            addr = %server.local_addr(),
            "Accepting peer connections"
        );

        self.raft_node.connect_to_peers();
        self.raft_node.init().await;

        if let Some(addr) = self.config.status_addr {
            run_status_server(addr, self.raft_node.status(), scope).await?;
        }
        Ok(())
    }
}
