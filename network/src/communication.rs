use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use consensus::{Message, NodeId, Recipient};

use crate::codec::{encode_frame, write_frame};
use crate::{Config, NetworkError, Result};

/// Replies queued per client before further replies to it are dropped.
const CLIENT_QUEUE_CAPACITY: usize = 64;

/// Delivers the node's outbound messages.
///
/// Each peer gets its own link task fed by a bounded queue, and so does each
/// connected client. The dispatcher itself never waits on a socket.
pub struct MessageHandler {
    id: NodeId,
    clients: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Message>>>>,
    config: Config,
}

impl MessageHandler {
    pub fn new(config: Config) -> Self {
        Self {
            id: config.id(),
            clients: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Starts the writer task for a newly accepted client connection.
    pub async fn register_client(&self, addr: SocketAddr, writer: OwnedWriteHalf) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.lock().await.insert(addr, tx);
        tokio::spawn(Self::client_link(
            self.id,
            addr,
            writer,
            rx,
            self.clients.clone(),
        ));
        tracing::debug!("{} registered client {}", self.id, addr);
    }

    pub async fn forget_client(&self, addr: SocketAddr) {
        if self.clients.lock().await.remove(&addr).is_some() {
            tracing::debug!("{} forgot client {}", self.id, addr);
        }
    }

    pub async fn connected_clients(&self) -> Vec<SocketAddr> {
        self.clients.lock().await.keys().copied().collect()
    }

    /// Drains `outbound` until it closes. Dropping the future stops every
    /// peer link.
    pub async fn start(&self, mut outbound: mpsc::UnboundedReceiver<Message>) -> Result<()> {
        tracing::info!("Starting message handler for {}", self.id);

        let backoff = Duration::from_millis(self.config.reconnect_backoff_ms);
        let mut links = HashMap::new();
        let mut tasks = JoinSet::new();

        for peer in &self.config.peers {
            let (tx, rx) = mpsc::channel(self.config.peer_queue_capacity.max(1));
            links.insert(*peer, tx);
            tasks.spawn(Self::peer_link(self.id, *peer, rx, backoff));
        }

        while let Some(message) = outbound.recv().await {
            if let Err(e) = self.dispatch(&links, message).await {
                tracing::warn!("{} dropped outbound message: {}", self.id, e);
            }
        }

        tracing::info!("{} outbound queue closed", self.id);
        tasks.shutdown().await;
        Ok(())
    }

    async fn dispatch(
        &self,
        links: &HashMap<NodeId, mpsc::Sender<Message>>,
        message: Message,
    ) -> Result<()> {
        match message.recipient() {
            Some(Recipient::Peer(peer)) => {
                let link = links.get(&peer).ok_or(NetworkError::UnknownPeer(peer))?;
                link.try_send(message).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(m) => NetworkError::ConnectionFailed(format!(
                        "queue to {} full, dropping {}",
                        peer,
                        m.kind()
                    )),
                    mpsc::error::TrySendError::Closed(_) => {
                        NetworkError::ConnectionFailed(format!("link to {} closed", peer))
                    }
                })
            }
            Some(Recipient::Client(addr)) => self.reply_to_client(addr, message).await,
            None => Err(NetworkError::Protocol(format!(
                "{} has no destination",
                message.kind()
            ))),
        }
    }

    /// Best effort: a reply for a client whose queue is full is dropped.
    async fn reply_to_client(&self, addr: SocketAddr, message: Message) -> Result<()> {
        let link = self.clients.lock().await.get(&addr).cloned().ok_or_else(|| {
            NetworkError::ConnectionFailed(format!("client {} is not connected", addr))
        })?;

        link.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                NetworkError::ConnectionFailed(format!("client {} is not reading replies", addr))
            }
            mpsc::error::TrySendError::Closed(_) => {
                NetworkError::ConnectionFailed(format!("client {} went away", addr))
            }
        })
    }

    /// Writes replies to one client. The first failed write ends the link
    /// and forgets the client.
    async fn client_link(
        id: NodeId,
        addr: SocketAddr,
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::Receiver<Message>,
        clients: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Message>>>>,
    ) {
        while let Some(message) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::warn!("{} cannot reply to client {}: {}", id, addr, e);
                clients.lock().await.remove(&addr);
                return;
            }
            tracing::trace!("{} replied to client {}", id, addr);
        }
    }

    /// Owns the connection to one peer. Connects lazily, and after a
    /// failed write reconnects and resends the same frame.
    async fn peer_link(
        id: NodeId,
        peer: NodeId,
        mut queue: mpsc::Receiver<Message>,
        backoff: Duration,
    ) {
        let mut stream: Option<TcpStream> = None;

        while let Some(message) = queue.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("{} cannot encode {} for {}: {}", id, message.kind(), peer, e);
                    continue;
                }
            };

            loop {
                if stream.is_none() {
                    match TcpStream::connect(peer.addr()).await {
                        Ok(connection) => {
                            let _ = connection.set_nodelay(true);
                            tracing::debug!("{} connected to {}", id, peer);
                            stream = Some(connection);
                        }
                        Err(e) => {
                            tracing::trace!("{} cannot reach {}: {}", id, peer, e);
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    }
                }
                let Some(connection) = stream.as_mut() else {
                    continue;
                };

                match connection.write_all(&frame).await {
                    Ok(()) => {
                        tracing::trace!("{} sent {} to {}", id, message.kind(), peer);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("{} lost connection to {}: {}", id, peer, e);
                        stream = None;
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}
