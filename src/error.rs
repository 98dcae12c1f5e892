use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftPeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RaftPeerError>;
