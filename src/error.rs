use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    /// No response arrived before the deadline. Callers treat this as
    /// "peer unreachable" for the current round.
    #[error("Request timed out")]
    RequestTimeout,

    #[error("Connection lost")]
    ConnectionLost,

    /// A frame arrived on a channel that must never carry it.
    #[error("Illegal caller state: {0}")]
    IllegalCallerState(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Node is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;
