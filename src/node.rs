use crate::config::Config;
use crate::error::{RaftPeerError, Result};
use consensus::{ClusterView, PeerNode, Role};
use network::NetworkManager;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// A complete peer: consensus core, key/value store, and TCP transport.
pub struct Node {
    config: Config,
    peer: PeerNode,
    network: NetworkManager,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        let peer_listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            RaftPeerError::InvalidConfig(format!("cannot bind {}: {}", config.listen_addr, e))
        })?;
        let client_listener = TcpListener::bind(config.client_addr).await.map_err(|e| {
            RaftPeerError::InvalidConfig(format!("cannot bind {}: {}", config.client_addr, e))
        })?;
        Self::with_listeners(config, peer_listener, client_listener).await
    }

    /// Builds a node on listeners the caller already bound.
    pub async fn with_listeners(
        mut config: Config,
        peer_listener: TcpListener,
        client_listener: TcpListener,
    ) -> Result<Self> {
        config.listen_addr = peer_listener.local_addr()?;
        config.client_addr = client_listener.local_addr()?;
        config.validate()?;

        info!(
            "Initializing peer {} with {} other peer(s), clients on {}",
            config.listen_addr,
            config.peers.len(),
            config.client_addr
        );

        let peer = PeerNode::new(
            config.clone().into(),
            Box::new(storage::KvStore::new()),
        );
        let outbound = peer.take_outbound().await?;
        let network = NetworkManager::from_listeners(
            config.clone().into(),
            peer_listener,
            client_listener,
            peer.inbound(),
            outbound,
        );

        Ok(Self {
            config,
            peer,
            network,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer(&self) -> &PeerNode {
        &self.peer
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.config.client_addr
    }

    pub async fn status(&self) -> ClusterView {
        self.peer.status().await
    }

    /// Runs consensus, transport and the role monitor until one stops.
    pub async fn start(&self) -> Result<()> {
        info!("Starting peer {}", self.config.listen_addr);

        tokio::select! {
            result = self.peer.run() => {
                error!("Consensus stopped: {:?}", result);
                result.map_err(RaftPeerError::from)
            }
            result = self.network.start() => {
                error!("Network stopped: {:?}", result);
                result.map_err(RaftPeerError::from)
            }
            _ = Self::log_role_changes(&self.peer) => {
                error!("Role monitor stopped");
                Ok(())
            }
        }
    }

    async fn log_role_changes(peer: &PeerNode) {
        let mut views = peer.subscribe();
        let mut role = views.borrow().role;

        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            if view.role == role {
                continue;
            }
            role = view.role;
            match view.role {
                Role::Leader => info!(
                    "{} is leader for term {} (log {}, commit {:?})",
                    view.id, view.term, view.log_len, view.commit_index
                ),
                Role::Candidate => info!("{} is candidate for term {}", view.id, view.term),
                Role::Follower => info!(
                    "{} follows {:?} in term {}",
                    view.id,
                    view.leader.map(|l| l.to_string()),
                    view.term
                ),
            }
        }
    }
}
