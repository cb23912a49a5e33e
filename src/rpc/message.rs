use serde::{Deserialize, Serialize};

/// Identifier of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Election epoch. Never decreases on a node.
pub type Term = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// Opaque replicated entry. Only carried on the wire; nothing applies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLogRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub leader_commit_index: u64,
    pub entries: Vec<LogEntry>,
}

impl AppendLogRequest {
    pub fn heartbeat(term: Term, leader_id: NodeId, leader_commit_index: u64) -> Self {
        Self {
            term,
            leader_id,
            leader_commit_index,
            entries: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLogResponse {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum RpcRequest {
    RequestVote(VoteRequest),
    RequestPreVote(VoteRequest),
    AppendLog(AppendLogRequest),
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::RequestVote(_) => "request_vote",
            RpcRequest::RequestPreVote(_) => "request_pre_vote",
            RpcRequest::AppendLog(_) => "append_log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "result")]
pub enum RpcResponse {
    Vote(VoteResponse),
    AppendLog(AppendLogResponse),
}

/// Token pairing an outbound request with its inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything that travels over a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Frame {
    Request {
        id: CorrelationId,
        body: RpcRequest,
    },
    /// Fire-and-forget request; the server never answers it.
    OneWay { body: RpcRequest },
    Response {
        id: CorrelationId,
        body: RpcResponse,
    },
}
