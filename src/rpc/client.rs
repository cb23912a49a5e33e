use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{RaftError, Result};
use crate::rpc::codec::{frame_reader, read_frame, run_writer};
use crate::rpc::correlation::{CorrelationEngine, ResponseFuture};
use crate::rpc::message::{
    AppendLogRequest, AppendLogResponse, CorrelationId, Frame, NodeId, RpcRequest, RpcResponse,
    VoteRequest, VoteResponse,
};
use crate::scope::TaskScope;

/// The consensus RPCs one node can invoke on another.
#[async_trait]
pub trait RaftService: Send + Sync {
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse>;

    /// Reserved; current nodes always deny.
    async fn request_pre_vote(&self, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_log(&self, request: AppendLogRequest) -> Result<AppendLogResponse>;
}

/// Route a decoded request to a service and wrap the answer for the wire.
pub async fn dispatch(service: &dyn RaftService, request: RpcRequest) -> Result<RpcResponse> {
    match request {
        RpcRequest::RequestVote(req) => service.request_vote(req).await.map(RpcResponse::Vote),
        RpcRequest::RequestPreVote(req) => {
            service.request_pre_vote(req).await.map(RpcResponse::Vote)
        }
        RpcRequest::AppendLog(req) => service.append_log(req).await.map(RpcResponse::AppendLog),
    }
}

const OUTBOUND_BUFFER: usize = 256;

/// Peer handle backed by one TCP connection to a remote node.
///
/// The connection is (re)established in the background with a fixed backoff.
/// Requests issued while disconnected fail fast with
/// [`RaftError::ConnectionLost`]; requests already in flight are left to
/// their own timeouts.
pub struct RpcClient {
    peer_id: NodeId,
    addr: String,
    engine: CorrelationEngine<RpcResponse>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    request_timeout: Duration,
}

impl RpcClient {
    /// Create the client and start its connection manager on `scope`.
    pub fn connect(
        peer_id: NodeId,
        addr: String,
        request_timeout: Duration,
        reconnect_backoff: Duration,
        scope: &TaskScope,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            peer_id,
            addr,
            engine: CorrelationEngine::new(),
            outbound: Mutex::new(None),
            request_timeout,
        });

        let manager = client.clone();
        let manager_scope = scope.clone();
        scope.spawn(async move {
            manager.maintain_connection(manager_scope, reconnect_backoff).await;
        });

        client
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn pending_requests(&self) -> usize {
        self.engine.pending_count()
    }

    async fn maintain_connection(&self, scope: TaskScope, backoff: Duration) {
        let mut connected_once = false;
        loop {
            let attempt = tokio::select! {
                _ = scope.cancelled() => break,
                attempt = TcpStream::connect(&self.addr) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    connected_once = true;
                    tracing::info!(peer_id = %self.peer_id, addr = %self.addr, "Connected to peer");
                    let err = tokio::select! {
                        _ = scope.cancelled() => break,
                        result = self.serve_connection(stream, &scope) => result.err(),
                    };
                    *self.outbound.lock() = None;
                    match err {
                        Some(e @ RaftError::IllegalCallerState(_)) => {
                            tracing::error!(peer_id = %self.peer_id, error = %e, "Peer sent an invalid frame");
                        }
                        Some(e) => {
                            tracing::warn!(peer_id = %self.peer_id, error = %e, "Connection to peer lost");
                        }
                        None => {
                            tracing::warn!(peer_id = %self.peer_id, "Peer closed the connection");
                        }
                    }
                }
                Err(e) if connected_once => {
                    tracing::debug!(peer_id = %self.peer_id, error = %e, "Reconnect failed");
                }
                Err(e) => {
                    // Peers start in any order
                    tracing::trace!(peer_id = %self.peer_id, addr = %self.addr, error = %e, "Peer not reachable yet");
                }
            }

            tokio::select! {
                _ = scope.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        *self.outbound.lock() = None;
    }

    /// Pump one live connection until it fails.
    async fn serve_connection(&self, stream: TcpStream, scope: &TaskScope) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        *self.outbound.lock() = Some(tx);

        let writer = scope.spawn(run_writer(write_half, rx));
        let result = self.read_responses(read_half).await;
        writer.abort();
        result
    }

    async fn read_responses(&self, read_half: tokio::net::tcp::OwnedReadHalf) -> Result<()> {
        let mut reader = frame_reader(read_half);
        while let Some(frame) = read_frame(&mut reader).await {
            match frame? {
                Frame::Response { id, body } => {
                    self.engine.complete(id, body);
                }
                Frame::Request { .. } | Frame::OneWay { .. } => {
                    return Err(RaftError::IllegalCallerState(
                        "request frame received on a client connection".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn transmit(&self, frame: Frame) -> Result<()> {
        let tx = self.outbound.lock().clone().ok_or(RaftError::ConnectionLost)?;
        tx.send(frame).await.map_err(|_| RaftError::ConnectionLost)
    }

    /// Transmit a request and return its correlation id without waiting.
    ///
    /// The id is reclaimed if [`await_response`](Self::await_response) is not
    /// called within the client's request timeout.
    pub async fn send(&self, request: RpcRequest) -> Result<CorrelationId> {
        let id = self.engine.allocate(self.request_timeout);
        if let Err(e) = self.transmit(Frame::Request { id, body: request }).await {
            self.engine.abandon(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Wait up to `timeout` for the response to a request sent with
    /// [`send`](Self::send).
    pub async fn await_response(&self, id: CorrelationId, timeout: Duration) -> Result<RpcResponse> {
        self.engine.wait(id, timeout).await
    }

    /// Send and wait inline for the answer.
    pub async fn call(&self, request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        self.call_deferred(request, timeout).await?.await
    }

    /// Send and return a handle that resolves once the answer arrives.
    ///
    /// The waiter is registered before the frame is written, so dropping the
    /// returned handle (or this future) always reclaims the id.
    pub async fn call_deferred(
        &self,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<ResponseFuture<RpcResponse>> {
        let id = self.engine.allocate(timeout);
        let handle = self.engine.subscribe(id, timeout)?;
        self.transmit(Frame::Request { id, body: request }).await?;
        Ok(handle)
    }

    /// Fire-and-forget; no correlation id is allocated.
    pub async fn send_one_way(&self, request: RpcRequest) -> Result<()> {
        self.transmit(Frame::OneWay { body: request }).await
    }
}

fn unexpected(method: &str, body: RpcResponse) -> RaftError {
    RaftError::IllegalCallerState(format!("unexpected response to {method}: {body:?}"))
}

#[async_trait]
impl RaftService for RpcClient {
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        match self
            .call(RpcRequest::RequestVote(request), self.request_timeout)
            .await?
        {
            RpcResponse::Vote(resp) => Ok(resp),
            other => Err(unexpected("request_vote", other)),
        }
    }

    async fn request_pre_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        match self
            .call(RpcRequest::RequestPreVote(request), self.request_timeout)
            .await?
        {
            RpcResponse::Vote(resp) => Ok(resp),
            other => Err(unexpected("request_pre_vote", other)),
        }
    }

    async fn append_log(&self, request: AppendLogRequest) -> Result<AppendLogResponse> {
        match self
            .call(RpcRequest::AppendLog(request), self.request_timeout)
            .await?
        {
            RpcResponse::AppendLog(resp) => Ok(resp),
            other => Err(unexpected("append_log", other)),
        }
    }
}
