use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;

use crate::rpc::message::{NodeId, Term};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Role and term at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub role: RaftRole,
    pub term: Term,
}

#[derive(Debug)]
struct TermState {
    current_term: Term,
    role: RaftRole,
    /// Term of the election this node most recently started.
    campaign_term: Option<Term>,
    /// Term -> candidate this node voted for (possibly itself). Write-once.
    votes: BTreeMap<Term, NodeId>,
}

impl TermState {
    fn status(&self) -> NodeStatus {
        NodeStatus {
            role: self.role,
            term: self.current_term,
        }
    }

    fn advance_to(&mut self, term: Term) {
        self.current_term = term;
        // Votes for older terms can never matter again
        self.votes = self.votes.split_off(&term);
    }
}

/// Single owner of a node's term, role and vote bookkeeping.
///
/// # Election safety
///
/// - The term only moves forward, and only through [`compare_and_set_term`]
///   or [`step_down`], both of which re-check the expected term under the
///   same lock that guards every other mutation.
/// - A node votes at most once per term: [`record_vote_if_absent`] is a
///   write-once claim, and a candidate claims its own slot in
///   [`begin_campaign`] before asking anyone else.
/// - [`transition_to_leader`] only succeeds for the term the node is
///   campaigning in, so an election tallied after the term moved on can
///   never assert leadership.
/// - While leader, [`compare_and_set_term`] always fails; the only way out
///   is [`step_down`] on evidence of a newer term.
///
/// [`compare_and_set_term`]: NodeScheduler::compare_and_set_term
/// [`step_down`]: NodeScheduler::step_down
/// [`record_vote_if_absent`]: NodeScheduler::record_vote_if_absent
/// [`begin_campaign`]: NodeScheduler::begin_campaign
/// [`transition_to_leader`]: NodeScheduler::transition_to_leader
#[derive(Debug)]
pub struct NodeScheduler {
    state: RwLock<TermState>,
    last_heartbeat: RwLock<Option<Instant>>,
    heartbeat_timeout: Duration,
    status_tx: watch::Sender<NodeStatus>,
    transitions_tx: broadcast::Sender<NodeStatus>,
}

/// Transitions buffered per [`NodeScheduler::subscribe_transitions`]
/// receiver before it starts lagging.
pub const TRANSITION_BUFFER: usize = 1024;

impl NodeScheduler {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        let state = TermState {
            current_term: 0,
            role: RaftRole::Follower,
            campaign_term: None,
            votes: BTreeMap::new(),
        };
        let (status_tx, _) = watch::channel(state.status());
        let (transitions_tx, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            state: RwLock::new(state),
            last_heartbeat: RwLock::new(None),
            heartbeat_timeout,
            status_tx,
            transitions_tx,
        }
    }

    fn publish(&self, state: &TermState) {
        let status = state.status();
        self.status_tx.send_replace(status);
        // No receivers is the normal case outside of tests
        let _ = self.transitions_tx.send(status);
    }

    pub async fn current_term(&self) -> Term {
        self.state.read().await.current_term
    }

    pub async fn role(&self) -> RaftRole {
        self.state.read().await.role
    }

    pub async fn status(&self) -> NodeStatus {
        self.state.read().await.status()
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == RaftRole::Leader
    }

    pub async fn is_follower(&self) -> bool {
        self.role().await == RaftRole::Follower
    }

    /// Receiver for the latest role and term. Rapid changes are coalesced.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    /// Receiver for every role/term change from now on, in order, including
    /// ones that are superseded before the receiver gets to run.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<NodeStatus> {
        self.transitions_tx.subscribe()
    }

    /// Move the term from `expected` to `updated`. Fails if the term is no
    /// longer `expected` or if this node is leader.
    pub async fn compare_and_set_term(&self, expected: Term, updated: Term) -> bool {
        let mut state = self.state.write().await;
        if state.current_term != expected || state.role == RaftRole::Leader || updated < expected {
            return false;
        }
        state.advance_to(updated);
        self.publish(&state);
        true
    }

    /// Start campaigning in `term`: vote for ourselves and become candidate.
    /// Fails if the term moved, we are leader, or we already voted for
    /// someone else in this term.
    pub async fn begin_campaign(&self, term: Term, self_id: NodeId) -> bool {
        let mut state = self.state.write().await;
        if state.current_term != term || state.role == RaftRole::Leader {
            return false;
        }
        let voted_for = *state.votes.entry(term).or_insert(self_id);
        if voted_for != self_id {
            return false;
        }
        state.role = RaftRole::Candidate;
        state.campaign_term = Some(term);
        self.publish(&state);
        tracing::debug!(term, "Became candidate");
        true
    }

    /// Assert leadership for `term`, provided nothing has moved since the
    /// campaign for `term` began.
    pub async fn transition_to_leader(&self, term: Term) -> bool {
        let mut state = self.state.write().await;
        if state.current_term != term
            || state.role != RaftRole::Candidate
            || state.campaign_term != Some(term)
        {
            return false;
        }
        state.role = RaftRole::Leader;
        self.publish(&state);
        true
    }

    /// Claim this node's vote in `term` for `candidate`. Returns true only
    /// for the call that claimed the slot.
    pub async fn record_vote_if_absent(&self, term: Term, candidate: NodeId) -> bool {
        let mut state = self.state.write().await;
        if term < state.current_term || state.votes.contains_key(&term) {
            return false;
        }
        state.votes.insert(term, candidate);
        true
    }

    /// Check that `leader` is the node this one backs in `term`, claiming the
    /// vote slot for it if nobody holds it yet.
    pub async fn recognize_leader(&self, term: Term, leader: NodeId) -> bool {
        let mut state = self.state.write().await;
        if term < state.current_term {
            return false;
        }
        *state.votes.entry(term).or_insert(leader) == leader
    }

    pub async fn voted_for(&self, term: Term) -> Option<NodeId> {
        self.state.read().await.votes.get(&term).copied()
    }

    /// Adopt a strictly greater term seen from a peer and fall back to
    /// follower. Unlike [`compare_and_set_term`](Self::compare_and_set_term)
    /// this also demotes a leader.
    pub async fn step_down(&self, expected: Term, observed: Term) -> bool {
        let mut state = self.state.write().await;
        if state.current_term != expected || observed <= state.current_term {
            return false;
        }
        let was = state.role;
        state.advance_to(observed);
        state.role = RaftRole::Follower;
        state.campaign_term = None;
        self.publish(&state);
        if was != RaftRole::Follower {
            tracing::info!(term = observed, from = %was, "Stepped down to follower");
        }
        true
    }

    /// Become follower if still in `term`. A no-op for a leader, whose role
    /// only changes through [`step_down`](Self::step_down).
    pub async fn ensure_follower(&self, term: Term) {
        let mut state = self.state.write().await;
        if state.current_term == term && state.role == RaftRole::Candidate {
            state.role = RaftRole::Follower;
            state.campaign_term = None;
            self.publish(&state);
        }
    }

    pub async fn mark_heartbeat_received(&self) {
        *self.last_heartbeat.write().await = Some(Instant::now());
    }

    /// True when no heartbeat arrived within the heartbeat timeout, or none
    /// ever did.
    pub async fn is_heartbeat_stale(&self) -> bool {
        match *self.last_heartbeat.read().await {
            Some(at) => at.elapsed() > self.heartbeat_timeout,
            None => true,
        }
    }
}
