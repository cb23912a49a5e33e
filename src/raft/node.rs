use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Duration, Instant};

use crate::config::{ClusterConfig, NodeConfig};
use crate::error::Result;
use crate::raft::rpc::{handle_append_log, handle_request_pre_vote, handle_request_vote};
use crate::raft::state::{NodeScheduler, RaftRole};
use crate::raft::timer::{self, random_election_timeout, TimerSlot};
use crate::rpc::client::{RaftService, RpcClient};
use crate::rpc::message::{
    AppendLogRequest, AppendLogResponse, NodeId, Term, VoteRequest, VoteResponse,
};
use crate::scope::TaskScope;
use crate::status::StatusObserver;
use crate::storage::LogStore;

/// The Raft node that drives elections and heartbeats
///
/// All term/role/vote state lives in the [`NodeScheduler`]; this type only
/// decides when to ask for it to change. Every background task runs on the
/// node's [`TaskScope`] and stops on [`close`](Self::close).
pub struct RaftNode {
    id: NodeId,
    config: NodeConfig,
    cluster: ClusterConfig,
    scheduler: Arc<NodeScheduler>,
    storage: Arc<dyn LogStore>,
    peers: RwLock<HashMap<NodeId, Arc<dyn RaftService>>>,
    election_timer: TimerSlot,
    heartbeat_timer: TimerSlot,
    scope: TaskScope,
}

impl RaftNode {
    pub fn new(config: NodeConfig, storage: Arc<dyn LogStore>) -> Arc<Self> {
        Arc::new(Self {
            id: config.node_id,
            cluster: config.cluster(),
            scheduler: Arc::new(NodeScheduler::new(config.heartbeat_timeout())),
            storage,
            peers: RwLock::new(HashMap::new()),
            election_timer: TimerSlot::new(),
            heartbeat_timer: TimerSlot::new(),
            scope: TaskScope::new(),
            config,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn scheduler(&self) -> &Arc<NodeScheduler> {
        &self.scheduler
    }

    pub fn scope(&self) -> &TaskScope {
        &self.scope
    }

    pub fn status(&self) -> StatusObserver {
        StatusObserver::new(self.id, self.scheduler.subscribe())
    }

    /// Register the handle used to reach `peer_id`, replacing any earlier one.
    pub fn add_peer(&self, peer_id: NodeId, peer: Arc<dyn RaftService>) {
        self.peers.write().insert(peer_id, peer);
    }

    /// Open a TCP client to every configured peer. Connections are made in
    /// the background, so peers may come up in any order.
    pub fn connect_to_peers(&self) {
        for peer in &self.config.peers {
            let client = RpcClient::connect(
                peer.node_id,
                peer.addr.clone(),
                self.config.rpc_timeout(),
                self.config.reconnect_backoff(),
                &self.scope,
            );
            self.add_peer(peer.node_id, client);
        }
    }

    fn peer_handles(&self) -> Vec<(NodeId, Arc<dyn RaftService>)> {
        self.peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect()
    }

    /// Start as follower and arm the first election timeout.
    pub async fn init(self: &Arc<Self>) {
        let status = self.scheduler.status().await;
        let delay = self.arm_election_timeout();
        tracing::info!(
            node_id = %self.id,
            term = status.term,
            peers = self.cluster.peers.len(),
            timeout_ms = delay.as_millis() as u64,
            "Raft node started as follower"
        );
    }

    /// Cancel timers, peer connections and in-flight work, and wait for them.
    pub async fn close(&self) {
        self.election_timer.cancel();
        self.heartbeat_timer.cancel();
        self.scope.shutdown().await;
        tracing::info!(node_id = %self.id, "Raft node stopped");
    }

    /// Re-arm the election timer with a fresh random delay and return it.
    fn arm_election_timeout(self: &Arc<Self>) -> Duration {
        let delay = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        let node = Arc::downgrade(self);
        self.election_timer
            .replace(timer::schedule(&self.scope, delay, move || async move {
                if let Some(node) = node.upgrade() {
                    node.on_election_timeout().await;
                }
            }));
        delay
    }

    /// Run the election-timeout handler now instead of waiting for the timer.
    pub async fn fire_election_timeout(self: &Arc<Self>) {
        self.clone().on_election_timeout().await;
    }

    async fn on_election_timeout(self: Arc<Self>) {
        self.arm_election_timeout();

        if self.scheduler.is_leader().await || !self.scheduler.is_heartbeat_stale().await {
            return;
        }

        let term = self.scheduler.current_term().await;
        tracing::info!(node_id = %self.id, term, "Election timeout, starting election");
        self.vote_for_leader(term + 1).await;
    }

    /// Campaign for leadership of `candidate_term`. Returns true if this node
    /// became leader.
    pub async fn vote_for_leader(self: &Arc<Self>, candidate_term: Term) -> bool {
        let Some(expected) = candidate_term.checked_sub(1) else {
            return false;
        };
        if !self
            .scheduler
            .compare_and_set_term(expected, candidate_term)
            .await
        {
            tracing::debug!(node_id = %self.id, term = candidate_term, "Term moved, abandoning election");
            return false;
        }
        if !self.scheduler.begin_campaign(candidate_term, self.id).await {
            tracing::debug!(node_id = %self.id, term = candidate_term, "Vote already cast, abandoning election");
            return false;
        }

        // The next timeout doubles as the deadline for this round
        let deadline = Instant::now() + self.arm_election_timeout();
        let majority = self.cluster.majority();
        let request = VoteRequest {
            term: candidate_term,
            candidate_id: self.id,
            last_log_index: self.storage.commit_index(),
        };

        let peers = self.peer_handles();
        let mut outstanding = peers.len();
        let (tx, mut rx) = mpsc::channel(outstanding.max(1));
        let rpc_timeout = self.config.rpc_timeout();
        for (peer_id, peer) in peers {
            let tx = tx.clone();
            let request = request.clone();
            self.scope.spawn(async move {
                let result = timeout(rpc_timeout, peer.request_vote(request)).await;
                // The collector may have finished already
                let _ = tx.send((peer_id, result)).await;
            });
        }
        drop(tx);

        let mut votes = 1usize; // Vote for self
        while votes < majority && outstanding > 0 {
            let (peer_id, result) = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(node_id = %self.id, term = candidate_term, outstanding, "Vote collection deadline passed");
                    break;
                }
            };
            outstanding -= 1;

            match result {
                Ok(Ok(resp)) => {
                    if resp.term > candidate_term {
                        // Higher term seen, become follower
                        if self.scheduler.step_down(candidate_term, resp.term).await {
                            tracing::info!(node_id = %self.id, %peer_id, term = resp.term, "Newer term seen during election");
                        }
                        return false;
                    }
                    if resp.granted {
                        votes += 1;
                        tracing::debug!(node_id = %self.id, %peer_id, votes, "Received vote");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(node_id = %self.id, %peer_id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::warn!(node_id = %self.id, %peer_id, "Vote request timed out");
                }
            }
        }

        if votes < majority {
            tracing::debug!(
                node_id = %self.id,
                term = candidate_term,
                votes,
                needed = majority,
                "Election failed, not enough votes"
            );
            return false;
        }

        if !self.scheduler.transition_to_leader(candidate_term).await {
            tracing::debug!(node_id = %self.id, term = candidate_term, "Election won too late, term moved on");
            return false;
        }

        tracing::info!(node_id = %self.id, term = candidate_term, votes, "Became leader");
        self.start_heartbeat();
        true
    }

    /// Send the first heartbeat right away; the chain continues while this
    /// node stays leader.
    fn start_heartbeat(self: &Arc<Self>) {
        let node = Arc::downgrade(self);
        self.heartbeat_timer
            .replace(timer::schedule(&self.scope, Duration::ZERO, move || async move {
                if let Some(node) = node.upgrade() {
                    node.broadcast_heartbeat().await;
                }
            }));
    }

    fn schedule_next_heartbeat(self: &Arc<Self>) {
        let guard_node: Weak<Self> = Arc::downgrade(self);
        let node = guard_node.clone();
        self.heartbeat_timer.replace(timer::schedule_gated(
            &self.scope,
            self.config.heartbeat_interval(),
            move || async move {
                match guard_node.upgrade() {
                    Some(node) => node.scheduler.is_leader().await,
                    None => false,
                }
            },
            move || async move {
                if let Some(node) = node.upgrade() {
                    node.broadcast_heartbeat().await;
                }
            },
        ));
    }

    /// Send heartbeats to all followers (leader only)
    async fn broadcast_heartbeat(self: Arc<Self>) {
        let status = self.scheduler.status().await;
        if status.role != RaftRole::Leader {
            return;
        }

        let term = status.term;
        let request = AppendLogRequest::heartbeat(term, self.id, self.storage.commit_index());
        let rpc_timeout = self.config.rpc_timeout();

        for (peer_id, peer) in self.peer_handles() {
            let request = request.clone();
            let scheduler = self.scheduler.clone();
            let node_id = self.id;

            self.scope.spawn(async move {
                match timeout(rpc_timeout, peer.append_log(request)).await {
                    Ok(Ok(resp)) if resp.term > term => {
                        if scheduler.step_down(term, resp.term).await {
                            tracing::info!(%node_id, %peer_id, term = resp.term, "Newer term seen in heartbeat response");
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::trace!(%node_id, %peer_id, error = %e, "Heartbeat failed");
                    }
                    Err(_) => {
                        tracing::trace!(%node_id, %peer_id, "Heartbeat timed out");
                    }
                }
            });
        }

        self.schedule_next_heartbeat();
    }
}

#[async_trait]
impl RaftService for RaftNode {
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        Ok(handle_request_vote(&self.scheduler, self.storage.as_ref(), &request, self.id).await)
    }

    async fn request_pre_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        Ok(handle_request_pre_vote(&self.scheduler, &request, self.id).await)
    }

    async fn append_log(&self, request: AppendLogRequest) -> Result<AppendLogResponse> {
        Ok(handle_append_log(&self.scheduler, &request, self.id).await)
    }
}
