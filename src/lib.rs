pub mod config;
pub mod error;
pub mod node;
pub mod raft;
pub mod rpc;
pub mod scope;
pub mod shutdown;
pub mod status;
pub mod storage;

pub use error::{RaftError, Result};
pub use rpc::message::NodeId;
