//! Test harness for multi-node election tests.
//!
//! Runs whole clusters in one process. Nodes talk through [`LocalPeer`]
//! handles that route calls straight into the target node, with a shared
//! [`Network`] that can delay, drop, or partition traffic.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast::{self, error::TryRecvError};

use raft_election::config::NodeConfig;
use raft_election::raft::{NodeStatus, RaftNode, RaftRole};
use raft_election::rpc::message::{
    AppendLogRequest, AppendLogResponse, NodeId, Term, VoteRequest, VoteResponse,
};
use raft_election::rpc::RaftService;
use raft_election::storage::MemoryLogStore;
use raft_election::{RaftError, Result};

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: u64, num_nodes: usize) -> NodeConfig {
    let mut config = NodeConfig::new(NodeId(node_id), "127.0.0.1:0".parse().unwrap());
    for peer in 1..=num_nodes as u64 {
        if peer != node_id {
            config = config.with_peer(NodeId(peer), format!("local-{peer}"));
        }
    }
    config.election_timeout_min_ms = 100;
    config.election_timeout_max_ms = 200;
    config.heartbeat_interval_ms = 20;
    config.heartbeat_timeout_ms = 80;
    config.rpc_timeout_ms = 50;
    config
}

/// Links between in-process nodes.
#[derive(Default)]
pub struct Network {
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
    down: Mutex<HashSet<NodeId>>,
    max_latency: Mutex<Duration>,
}

impl Network {
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.blocked.lock().insert((from, to));
    }

    pub fn unblock(&self, from: NodeId, to: NodeId) {
        self.blocked.lock().remove(&(from, to));
    }

    /// Every message is delayed by a random amount up to `max`, so replies
    /// can arrive out of order.
    pub fn set_max_latency(&self, max: Duration) {
        *self.max_latency.lock() = max;
    }

    fn check(&self, from: NodeId, to: NodeId) -> Result<()> {
        let down = self.down.lock();
        if down.contains(&from) || down.contains(&to) || self.blocked.lock().contains(&(from, to))
        {
            return Err(RaftError::ConnectionLost);
        }
        Ok(())
    }

    async fn delay(&self) {
        let max = *self.max_latency.lock();
        if max.is_zero() {
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

/// Peer handle that calls the target node directly.
pub struct LocalPeer {
    from: NodeId,
    to: NodeId,
    target: Weak<RaftNode>,
    network: Arc<Network>,
}

impl LocalPeer {
    async fn target(&self) -> Result<Arc<RaftNode>> {
        self.network.check(self.from, self.to)?;
        self.network.delay().await;
        // A partition may have formed while the message was in flight
        self.network.check(self.from, self.to)?;
        self.target.upgrade().ok_or(RaftError::ConnectionLost)
    }

    async fn reply<T>(&self, response: T) -> Result<T> {
        self.network.delay().await;
        self.network.check(self.to, self.from)?;
        Ok(response)
    }
}

#[async_trait]
impl RaftService for LocalPeer {
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let response = self.target().await?.request_vote(request).await?;
        self.reply(response).await
    }

    async fn request_pre_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let response = self.target().await?.request_pre_vote(request).await?;
        self.reply(response).await
    }

    async fn append_log(&self, request: AppendLogRequest) -> Result<AppendLogResponse> {
        let response = self.target().await?.append_log(request).await?;
        self.reply(response).await
    }
}

/// Handle to a test node
pub struct TestNode {
    pub node_id: NodeId,
    pub raft_node: Arc<RaftNode>,
    pub storage: Arc<MemoryLogStore>,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.raft_node.scheduler().is_leader().await
    }

    pub async fn role(&self) -> RaftRole {
        self.raft_node.scheduler().role().await
    }

    pub async fn current_term(&self) -> Term {
        self.raft_node.scheduler().current_term().await
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: BTreeMap<NodeId, TestNode>,
    pub network: Arc<Network>,
}

impl TestCluster {
    /// Create and start a cluster with n nodes
    pub async fn new(num_nodes: usize) -> Self {
        let cluster = Self::build(num_nodes, |_| {});
        cluster.start().await;
        cluster
    }

    /// Create a cluster without arming any timers. Elections happen only
    /// through [`RaftNode::fire_election_timeout`] or
    /// [`RaftNode::vote_for_leader`].
    pub fn manual(num_nodes: usize) -> Self {
        Self::build(num_nodes, |config| {
            config.election_timeout_min_ms = 60_000;
            config.election_timeout_max_ms = 60_000;
        })
    }

    /// Create a cluster, adjusting each node's config with `tweak`.
    pub fn build(num_nodes: usize, tweak: impl Fn(&mut NodeConfig)) -> Self {
        let network = Arc::new(Network::default());
        let mut nodes = BTreeMap::new();

        for id in 1..=num_nodes as u64 {
            let mut config = test_node_config(id, num_nodes);
            tweak(&mut config);
            let storage = Arc::new(MemoryLogStore::new());
            let raft_node = RaftNode::new(config, storage.clone());
            nodes.insert(
                NodeId(id),
                TestNode {
                    node_id: NodeId(id),
                    raft_node,
                    storage,
                },
            );
        }

        // Wire every node to every other node
        for (from, node) in &nodes {
            for (to, target) in &nodes {
                if from == to {
                    continue;
                }
                let peer = LocalPeer {
                    from: *from,
                    to: *to,
                    target: Arc::downgrade(&target.raft_node),
                    network: network.clone(),
                };
                node.raft_node.add_peer(*to, Arc::new(peer));
            }
        }

        Self { nodes, network }
    }

    /// Arm every node's election timer
    pub async fn start(&self) {
        for node in self.nodes.values() {
            node.raft_node.init().await;
        }
    }

    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&NodeId(node_id))
    }

    pub fn raft(&self, node_id: u64) -> &Arc<RaftNode> {
        &self.nodes[&NodeId(node_id)].raft_node
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<NodeId> {
        let all: Vec<u64> = self.nodes.keys().map(|id| id.0).collect();
        self.wait_for_leader_in_group(&all, timeout_duration).await
    }

    /// Leader with the highest term, if any
    pub async fn get_leader_id(&self) -> Option<NodeId> {
        let mut best: Option<(Term, NodeId)> = None;
        for node in self.nodes.values() {
            let status = node.raft_node.scheduler().status().await;
            if status.role == RaftRole::Leader && best.map_or(true, |(t, _)| status.term > t) {
                best = Some((status.term, node.node_id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Count the number of leaders in the cluster
    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Wait for a leader to emerge within a specific group of nodes
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[u64],
        timeout_duration: Duration,
    ) -> Option<NodeId> {
        let found = wait_for(
            || async { self.leader_in_group(group).await.is_some() },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;
        if found {
            self.leader_in_group(group).await
        } else {
            None
        }
    }

    async fn leader_in_group(&self, group: &[u64]) -> Option<NodeId> {
        for &node_id in group {
            if let Some(node) = self.get_node(node_id) {
                if node.is_leader().await {
                    return Some(node.node_id);
                }
            }
        }
        None
    }

    /// Create a network partition: group_a can't communicate with group_b and vice versa
    pub fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.network.block(NodeId(a), NodeId(b));
                self.network.block(NodeId(b), NodeId(a));
            }
        }
    }

    /// Heal a network partition: restore communication between groups
    pub fn heal_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.network.unblock(NodeId(a), NodeId(b));
                self.network.unblock(NodeId(b), NodeId(a));
            }
        }
    }

    /// Isolate a node from all other nodes
    pub fn isolate_node(&self, node_id: u64) {
        let others = self.other_ids(node_id);
        self.create_partition(&[node_id], &others);
    }

    pub fn heal_node(&self, node_id: u64) {
        let others = self.other_ids(node_id);
        self.heal_partition(&[node_id], &others);
    }

    fn other_ids(&self, node_id: u64) -> Vec<u64> {
        self.nodes
            .keys()
            .map(|id| id.0)
            .filter(|&id| id != node_id)
            .collect()
    }

    /// Stop a node and cut it off (simulates crash)
    pub async fn crash_node(&mut self, node_id: u64) -> bool {
        let Some(node) = self.nodes.remove(&NodeId(node_id)) else {
            return false;
        };
        self.network.down.lock().insert(node.node_id);
        node.raft_node.close().await;
        true
    }

    /// Record every status transition of every node from now on.
    pub fn record_history(&self) -> History {
        let mut receivers = Vec::new();
        let mut events = Vec::new();
        for node in self.nodes.values() {
            let rx = node.raft_node.scheduler().subscribe_transitions();
            events.push((node.node_id, node.raft_node.status().snapshot()));
            receivers.push((node.node_id, rx));
        }
        History {
            receivers: Mutex::new(receivers),
            events: Mutex::new(events),
        }
    }

    /// Shutdown all nodes
    pub async fn shutdown(&mut self) {
        for node in self.nodes.values() {
            node.raft_node.close().await;
        }
        self.nodes.clear();
    }
}

/// Every status change of every node, in order per node.
pub struct History {
    receivers: Mutex<Vec<(NodeId, broadcast::Receiver<NodeStatus>)>>,
    events: Mutex<Vec<(NodeId, NodeStatus)>>,
}

impl History {
    /// Pull whatever transitions have been published since the last call.
    fn drain(&self) {
        let mut receivers = self.receivers.lock();
        let mut events = self.events.lock();
        for (node, rx) in receivers.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(status) => events.push((*node, status)),
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    Err(TryRecvError::Lagged(missed)) => {
                        panic!("history lost {missed} transitions of node {node}")
                    }
                }
            }
        }
    }

    pub fn events(&self) -> Vec<(NodeId, NodeStatus)> {
        self.drain();
        self.events.lock().clone()
    }

    /// Term -> every node seen as leader in that term
    pub fn leaders_by_term(&self) -> BTreeMap<Term, HashSet<NodeId>> {
        let mut leaders: BTreeMap<Term, HashSet<NodeId>> = BTreeMap::new();
        for (node, status) in self.events() {
            if status.role == RaftRole::Leader {
                leaders.entry(status.term).or_default().insert(node);
            }
        }
        leaders
    }

    /// Panics if any term had two leaders or any node's term went backwards
    pub fn assert_election_safety(&self) {
        for (term, leaders) in self.leaders_by_term() {
            assert!(
                leaders.len() <= 1,
                "term {term} had {} leaders: {leaders:?}",
                leaders.len()
            );
        }

        let mut last_term: BTreeMap<NodeId, Term> = BTreeMap::new();
        for (node, status) in self.events() {
            let last = last_term.entry(node).or_insert(0);
            assert!(
                status.term >= *last,
                "node {node} went from term {last} to {}",
                status.term
            );
            *last = status.term;
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
