use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{RaftError, Result};
use crate::raft::state::{NodeStatus, RaftRole};
use crate::rpc::message::{NodeId, Term};
use crate::scope::TaskScope;

/// Read-only view of one node's role and term.
#[derive(Clone)]
pub struct StatusObserver {
    node_id: NodeId,
    rx: watch::Receiver<NodeStatus>,
}

impl StatusObserver {
    pub fn new(node_id: NodeId, rx: watch::Receiver<NodeStatus>) -> Self {
        Self { node_id, rx }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn snapshot(&self) -> NodeStatus {
        *self.rx.borrow()
    }

    /// Wait for the next role or term change and return the new status.
    /// Fails with [`RaftError::Shutdown`] once the node is gone.
    pub async fn changed(&mut self) -> Result<NodeStatus> {
        self.rx.changed().await.map_err(|_| RaftError::Shutdown)?;
        Ok(*self.rx.borrow_and_update())
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node_id: NodeId,
    role: RaftRole,
    term: Term,
}

pub fn router(observer: StatusObserver) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(observer)
}

/// Serve the status page on `addr` until `scope` shuts down. Returns the
/// bound address.
pub async fn run_status_server(
    addr: SocketAddr,
    observer: StatusObserver,
    scope: &TaskScope,
) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Starting status server");

    let app = router(observer);
    let shutdown = scope.clone();
    scope.spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Status server failed");
        }
    });

    Ok(local_addr)
}

async fn status_handler(State(observer): State<StatusObserver>) -> impl IntoResponse {
    let status = observer.snapshot();
    Json(StatusResponse {
        node_id: observer.node_id(),
        role: status.role,
        term: status.term,
    })
}
