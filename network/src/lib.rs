mod codec;
mod communication;
mod manager;

pub use codec::{decode_frame, decode_frame_bytes, encode_frame, write_frame};
pub use communication::MessageHandler;
pub use manager::NetworkManager;

use consensus::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),
}

/// Transport settings for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address other peers connect to; also this peer's id.
    pub listen_addr: SocketAddr,
    /// Address clients connect to.
    pub client_addr: SocketAddr,
    pub peers: Vec<NodeId>,
    pub reconnect_backoff_ms: u64,
    /// Per-peer outbound queue bound; overflow is dropped.
    pub peer_queue_capacity: usize,
}

impl Config {
    pub fn new(listen_addr: SocketAddr, client_addr: SocketAddr, peers: Vec<NodeId>) -> Self {
        let me = NodeId(listen_addr);
        Self {
            listen_addr,
            client_addr,
            peers: peers.into_iter().filter(|peer| *peer != me).collect(),
            reconnect_backoff_ms: 50,
            peer_queue_capacity: 1024,
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId(self.listen_addr)
    }
}
