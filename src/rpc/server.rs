use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::{RaftError, Result};
use crate::rpc::client::{dispatch, RaftService};
use crate::rpc::codec::{frame_reader, read_frame, run_writer};
use crate::rpc::message::Frame;
use crate::scope::TaskScope;

const OUTBOUND_BUFFER: usize = 256;

/// Accepts peer connections and answers their requests with `service`.
pub struct RpcServer {
    local_addr: SocketAddr,
}

impl RpcServer {
    /// Bind `addr` and start accepting on `scope`. Binding port 0 picks a free
    /// port; see [`local_addr`](Self::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        service: Arc<dyn RaftService>,
        scope: &TaskScope,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "RPC server listening");

        let accept_scope = scope.clone();
        scope.spawn(async move {
            accept_loop(listener, service, accept_scope).await;
        });

        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, service: Arc<dyn RaftService>, scope: TaskScope) {
    loop {
        let accepted = tokio::select! {
            _ = scope.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                let service = service.clone();
                let conn_scope = scope.clone();
                scope.spawn(async move {
                    let result = tokio::select! {
                        _ = conn_scope.cancelled() => Ok(()),
                        result = serve_connection(stream, service, &conn_scope) => result,
                    };
                    match result {
                        Ok(()) => tracing::debug!(remote = %remote, "Peer connection closed"),
                        Err(e @ RaftError::IllegalCallerState(_)) => {
                            tracing::error!(remote = %remote, error = %e, "Closing connection after invalid frame");
                        }
                        Err(e) => tracing::warn!(remote = %remote, error = %e, "Peer connection failed"),
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
            }
        }
    }
    tracing::debug!("RPC server stopped");
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<dyn RaftService>,
    scope: &TaskScope,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = scope.spawn(run_writer(write_half, rx));

    let mut reader = frame_reader(read_half);
    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };
        match frame {
            Frame::Request { id, body } => {
                let service = service.clone();
                let tx = tx.clone();
                scope.spawn(async move {
                    let method = body.method();
                    match dispatch(service.as_ref(), body).await {
                        Ok(body) => {
                            // The caller may be gone already; its waiter just times out
                            let _ = tx.send(Frame::Response { id, body }).await;
                        }
                        Err(e) => {
                            tracing::warn!(%id, method, error = %e, "Request handler failed");
                        }
                    }
                });
            }
            Frame::OneWay { body } => {
                let service = service.clone();
                scope.spawn(async move {
                    let method = body.method();
                    if let Err(e) = dispatch(service.as_ref(), body).await {
                        tracing::debug!(method, error = %e, "One-way request failed");
                    }
                });
            }
            Frame::Response { id, .. } => {
                break Err(RaftError::IllegalCallerState(format!(
                    "response {id} received on a server connection"
                )));
            }
        }
    };

    if result.is_err() {
        writer.abort();
    }
    result
}
