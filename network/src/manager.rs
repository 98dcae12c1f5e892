use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use consensus::{Message, NodeId};

use crate::codec::{decode_frame_bytes, FrameReader};
use crate::communication::MessageHandler;
use crate::{Config, NetworkError, Result};

/// TCP transport for one peer: a listener for other peers, a listener for
/// clients, and the outbound dispatcher.
///
/// Decoded messages are pushed into `inbound`; messages read from
/// `outbound` are delivered to peers or back to clients.
pub struct NetworkManager {
    id: NodeId,
    peer_listener: TcpListener,
    client_listener: TcpListener,
    handler: Arc<MessageHandler>,
    inbound: mpsc::UnboundedSender<Message>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl NetworkManager {
    pub async fn bind(
        config: Config,
        inbound: mpsc::UnboundedSender<Message>,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Result<Self> {
        let peer_listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("bind {}: {}", config.listen_addr, e))
        })?;
        let client_listener = TcpListener::bind(config.client_addr).await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("bind {}: {}", config.client_addr, e))
        })?;
        Ok(Self::from_listeners(
            config,
            peer_listener,
            client_listener,
            inbound,
            outbound,
        ))
    }

    /// Uses listeners bound by the caller, e.g. on port 0 in tests.
    pub fn from_listeners(
        config: Config,
        peer_listener: TcpListener,
        client_listener: TcpListener,
        inbound: mpsc::UnboundedSender<Message>,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            id: config.id(),
            peer_listener,
            client_listener,
            handler: Arc::new(MessageHandler::new(config)),
            inbound,
            outbound: Mutex::new(Some(outbound)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.peer_listener.local_addr()?)
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    pub fn handler(&self) -> Arc<MessageHandler> {
        self.handler.clone()
    }

    /// Runs both accept loops and the outbound dispatcher until one stops.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            "Starting network for {} (peers on {}, clients on {})",
            self.id,
            self.local_addr()?,
            self.client_addr()?
        );

        let outbound = {
            let mut guard = self.outbound.lock().await;
            guard.take().ok_or_else(|| {
                NetworkError::Protocol("Outbound receiver already taken".to_string())
            })?
        };

        tokio::select! {
            result = self.accept_peers() => {
                tracing::error!("{} peer listener stopped: {:?}", self.id, result);
                result
            }
            result = self.accept_clients() => {
                tracing::error!("{} client listener stopped: {:?}", self.id, result);
                result
            }
            result = self.handler.start(outbound) => {
                tracing::error!("{} message handler stopped: {:?}", self.id, result);
                result
            }
        }
    }

    async fn accept_peers(&self) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.peer_listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("{} peer accept failed: {}", self.id, e);
                            continue;
                        }
                    };
                    tracing::debug!("{} accepted peer connection from {}", self.id, remote);
                    let _ = stream.set_nodelay(true);
                    connections.spawn(receive_from_peer(
                        self.id,
                        remote,
                        stream,
                        self.inbound.clone(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    async fn accept_clients(&self) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.client_listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("{} client accept failed: {}", self.id, e);
                            continue;
                        }
                    };
                    tracing::info!("{} client connected from {}", self.id, remote);
                    let (reader, writer) = stream.into_split();
                    self.handler.register_client(remote, writer).await;
                    connections.spawn(receive_from_client(
                        self.id,
                        remote,
                        reader,
                        self.inbound.clone(),
                        self.handler.clone(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

/// Reads frames from another peer until the connection closes.
async fn receive_from_peer<R>(
    id: NodeId,
    remote: SocketAddr,
    reader: R,
    inbound: mpsc::UnboundedSender<Message>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);

    loop {
        let decoded = match frames.next_frame().await {
            Ok(Some(line)) => decode_frame_bytes(line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("{} read from peer {} failed: {}", id, remote, e);
                break;
            }
        };

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("{} dropping malformed frame from {}: {}", id, remote, e);
                continue;
            }
        };
        if matches!(message, Message::ClientCommand(_) | Message::CommandReply(_)) {
            tracing::warn!("{} dropping {} on peer connection from {}", id, message.kind(), remote);
            continue;
        }

        tracing::trace!("{} received {} from {}", id, message.kind(), remote);
        if inbound.send(message).is_err() {
            tracing::warn!("{} inbound queue closed", id);
            break;
        }
    }
    tracing::debug!("{} peer connection from {} closed", id, remote);
}

/// Reads `request_command` frames from a client and stamps them with the
/// client's address so the reply finds its way back.
async fn receive_from_client<R>(
    id: NodeId,
    remote: SocketAddr,
    reader: R,
    inbound: mpsc::UnboundedSender<Message>,
    handler: Arc<MessageHandler>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);

    loop {
        let decoded = match frames.next_frame().await {
            Ok(Some(line)) => decode_frame_bytes(line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("{} read from client {} failed: {}", id, remote, e);
                break;
            }
        };

        let mut command = match decoded {
            Ok(Message::ClientCommand(command)) => command,
            Ok(other) => {
                tracing::warn!("{} client {} may not send {}", id, remote, other.kind());
                continue;
            }
            Err(e) => {
                tracing::warn!("{} dropping malformed frame from client {}: {}", id, remote, e);
                continue;
            }
        };
        command.send_from = Some(remote);
        command.send_to = Some(id.addr());

        if inbound.send(Message::ClientCommand(command)).is_err() {
            tracing::warn!("{} inbound queue closed", id);
            break;
        }
    }

    handler.forget_client(remote).await;
    tracing::info!("{} client {} disconnected", id, remote);
}
