pub mod client;
pub mod codec;
pub mod correlation;
pub mod message;
pub mod server;

pub use client::{RaftService, RpcClient};
pub use correlation::{CorrelationEngine, ResponseFuture};
pub use server::RpcServer;
