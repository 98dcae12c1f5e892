use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{RaftPeerError, Result};

/// Settings for one peer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Peer-facing address; doubles as this peer's id.
    pub listen_addr: SocketAddr,
    pub client_addr: SocketAddr,
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_peer_queue_capacity")]
    pub peer_queue_capacity: usize,
}

fn default_election_timeout_min_ms() -> u64 {
    100
}

fn default_election_timeout_max_ms() -> u64 {
    150
}

fn default_heartbeat_interval_ms() -> u64 {
    40
}

fn default_reconnect_backoff_ms() -> u64 {
    50
}

fn default_peer_queue_capacity() -> usize {
    1024
}

impl Config {
    pub fn new(listen_addr: SocketAddr, client_addr: SocketAddr, peers: Vec<SocketAddr>) -> Self {
        Self {
            listen_addr,
            client_addr,
            peers,
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            peer_queue_capacity: default_peer_queue_capacity(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RaftPeerError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            RaftPeerError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// Checks timing constraints and drops this peer's own address (and
    /// duplicates) from `peers`.
    pub fn validate(&mut self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftPeerError::InvalidConfig(
                "election timeout must be positive".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftPeerError::InvalidConfig(format!(
                "election timeout range {}..{} ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftPeerError::InvalidConfig(format!(
                "heartbeat interval {} ms must be positive and below the election timeout {} ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.listen_addr == self.client_addr {
            return Err(RaftPeerError::InvalidConfig(format!(
                "peer and client listeners share {}",
                self.listen_addr
            )));
        }

        let me = self.listen_addr;
        let mut seen = Vec::with_capacity(self.peers.len());
        for peer in self.peers.drain(..) {
            if peer != me && !seen.contains(&peer) {
                seen.push(peer);
            }
        }
        self.peers = seen;
        Ok(())
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

impl From<Config> for consensus::Config {
    fn from(config: Config) -> Self {
        let id = consensus::NodeId(config.listen_addr);
        let peers = config.peers.into_iter().map(consensus::NodeId).collect();
        consensus::Config {
            election_timeout_min_ms: config.election_timeout_min_ms,
            election_timeout_max_ms: config.election_timeout_max_ms,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            ..consensus::Config::new(id, peers)
        }
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        let peers = config.peers.into_iter().map(consensus::NodeId).collect();
        network::Config {
            reconnect_backoff_ms: config.reconnect_backoff_ms,
            peer_queue_capacity: config.peer_queue_capacity,
            ..network::Config::new(config.listen_addr, config.client_addr, peers)
        }
    }
}
