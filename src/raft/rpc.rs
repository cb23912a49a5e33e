use crate::raft::state::NodeScheduler;
use crate::rpc::message::{AppendLogRequest, AppendLogResponse, NodeId, VoteRequest, VoteResponse};
use crate::storage::LogStore;

/// Handle RequestVote RPC
///
/// A vote is granted when the candidate's term is newer than ours and we
/// manage to adopt it, or when it equals ours; in both cases only if our
/// vote in that term is still unclaimed and the candidate has committed at
/// least as far as we have.
pub async fn handle_request_vote(
    scheduler: &NodeScheduler,
    storage: &dyn LogStore,
    req: &VoteRequest,
    my_id: NodeId,
) -> VoteResponse {
    let term = scheduler.current_term().await;
    let log_ok = req.last_log_index >= storage.commit_index();

    let granted = if req.term > term {
        // A newer term is adopted even if the vote is then denied
        scheduler.step_down(term, req.term).await
            && log_ok
            && scheduler
                .record_vote_if_absent(req.term, req.candidate_id)
                .await
    } else if req.term == term {
        log_ok
            && scheduler
                .record_vote_if_absent(term, req.candidate_id)
                .await
    } else {
        false
    };

    if granted {
        scheduler.ensure_follower(req.term).await;
        // Give the candidate a full timeout to assert itself
        scheduler.mark_heartbeat_received().await;
    }

    let current_term = scheduler.current_term().await;
    tracing::debug!(
        node_id = %my_id,
        candidate = %req.candidate_id,
        term = req.term,
        current_term,
        log_ok,
        granted,
        "RequestVote response"
    );

    VoteResponse {
        term: current_term,
        granted,
    }
}

/// Handle RequestPreVote RPC. Pre-voting is reserved, so this always denies.
pub async fn handle_request_pre_vote(
    scheduler: &NodeScheduler,
    req: &VoteRequest,
    my_id: NodeId,
) -> VoteResponse {
    let term = scheduler.current_term().await;
    tracing::trace!(node_id = %my_id, candidate = %req.candidate_id, "Pre-vote not supported");
    VoteResponse {
        term,
        granted: false,
    }
}

/// Handle AppendLog RPC
///
/// Accepted from the leader we back in the current term, or from any node
/// claiming a newer term. Acceptance refreshes the heartbeat clock. Entries
/// are not replicated by this node and are ignored.
pub async fn handle_append_log(
    scheduler: &NodeScheduler,
    req: &AppendLogRequest,
    my_id: NodeId,
) -> AppendLogResponse {
    let term = scheduler.current_term().await;

    let accepted = if req.term == term {
        scheduler.is_follower().await && scheduler.recognize_leader(term, req.leader_id).await
    } else if req.term > term && scheduler.step_down(term, req.term).await {
        scheduler.recognize_leader(req.term, req.leader_id).await;
        tracing::info!(node_id = %my_id, leader = %req.leader_id, term = req.term, "Following new leader");
        true
    } else {
        false
    };

    if !accepted {
        let current_term = scheduler.current_term().await;
        tracing::debug!(
            node_id = %my_id,
            leader = %req.leader_id,
            term = req.term,
            current_term,
            "Rejected AppendLog"
        );
        return AppendLogResponse {
            term: current_term,
            success: false,
        };
    }

    scheduler.mark_heartbeat_received().await;
    if !req.is_heartbeat() {
        tracing::debug!(
            node_id = %my_id,
            entries = req.entries.len(),
            "Ignoring replicated entries"
        );
    }

    AppendLogResponse {
        term: req.term,
        success: true,
    }
}
