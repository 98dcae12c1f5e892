use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;

use crate::election::start_candidacy;
use crate::replication::broadcast_append_entries;
use crate::router::route;
use crate::{
    Config, ConsensusError, Effects, ElectionTimer, LogIndex, Message, NodeId, PeerState, Result,
    Role, StateMachine, Term,
};

/// Externally visible summary of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub log_len: usize,
    pub commit_index: Option<LogIndex>,
}

impl ClusterView {
    fn of(state: &PeerState) -> Self {
        Self {
            id: state.id,
            role: state.role,
            term: state.current_term,
            leader: state.leader_id,
            log_len: state.log.len(),
            commit_index: state.commit_index,
        }
    }
}

struct Core {
    state: PeerState,
    machine: Box<dyn StateMachine>,
}

/// One consensus peer: its state behind a single lock, its election timer,
/// and the inbound/outbound queues shared with the transport.
///
/// Every transition locks the state, runs to completion without I/O, and
/// only then hands its outbound messages to the transport queue.
#[derive(Clone)]
pub struct PeerNode {
    id: NodeId,
    core: Arc<Mutex<Core>>,
    timer: ElectionTimer,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Message>>>>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Message>>>>,
    view: Arc<watch::Sender<ClusterView>>,
    heartbeat_interval: Duration,
}

impl PeerNode {
    pub fn new(config: Config, machine: Box<dyn StateMachine>) -> Self {
        let state = PeerState::new(config.id, config.peers.clone());
        let (view, _) = watch::channel(ClusterView::of(&state));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            id: config.id,
            core: Arc::new(Mutex::new(Core { state, machine })),
            timer: ElectionTimer::new(config.election_timeout_min_ms, config.election_timeout_max_ms),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(Some(outbound_rx))),
            view: Arc::new(view),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Queue the transport pushes decoded messages into.
    pub fn inbound(&self) -> mpsc::UnboundedSender<Message> {
        self.inbound_tx.clone()
    }

    /// Queue the transport drains to deliver messages. Can be taken once.
    pub async fn take_outbound(&self) -> Result<mpsc::UnboundedReceiver<Message>> {
        let mut guard = self.outbound_rx.lock().await;
        guard
            .take()
            .ok_or_else(|| ConsensusError::ChannelClosed("Outbound receiver already taken".to_string()))
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.view.subscribe()
    }

    pub async fn status(&self) -> ClusterView {
        let core = self.core.lock().await;
        ClusterView::of(&core.state)
    }

    pub async fn is_leader(&self) -> bool {
        self.core.lock().await.state.is_leader()
    }

    /// Runs the dispatch, election and heartbeat workers until one stops.
    ///
    /// Dropping the returned future stops all of them.
    pub async fn run(&self) -> Result<()> {
        let (min_ms, max_ms) = self.timer.interval_range();
        tracing::info!(
            "Starting consensus peer {} (election timeout {}-{} ms, heartbeat {:?})",
            self.id,
            min_ms,
            max_ms,
            self.heartbeat_interval
        );

        let receiver = {
            let mut guard = self.inbound_rx.lock().await;
            guard.take().ok_or_else(|| {
                ConsensusError::ChannelClosed("Inbound receiver already taken".to_string())
            })?
        };
        self.timer.reset();

        tokio::select! {
            result = self.dispatch_loop(receiver) => {
                tracing::error!("{} dispatch loop stopped: {:?}", self.id, result);
                Err(ConsensusError::ChannelClosed("Inbound queue closed".to_string()))
            }
            result = self.election_loop() => {
                tracing::error!("{} election loop stopped: {:?}", self.id, result);
                Err(ConsensusError::ChannelClosed("Election loop stopped".to_string()))
            }
            result = self.heartbeat_loop() => {
                tracing::error!("{} heartbeat loop stopped: {:?}", self.id, result);
                Err(ConsensusError::ChannelClosed("Heartbeat loop stopped".to_string()))
            }
        }
    }

    /// Handles one inbound message as a single locked transition.
    pub async fn handle(&self, message: Message) {
        self.transition(move |state, machine| route(state, machine, message))
            .await;
    }

    async fn dispatch_loop(&self, mut receiver: mpsc::UnboundedReceiver<Message>) -> Result<()> {
        while let Some(message) = receiver.recv().await {
            self.handle(message).await;
        }
        Ok(())
    }

    async fn election_loop(&self) -> Result<()> {
        loop {
            self.timer.wait().await;

            let timer = self.timer.clone();
            self.transition(move |state, _| {
                // A reset taken under the lock after the timer woke wins.
                if !timer.is_expired() {
                    return Effects::none();
                }
                if state.is_leader() {
                    return Effects {
                        reset_timer: true,
                        ..Effects::default()
                    };
                }
                tracing::info!(
                    "{} election timeout in term {} as {:?}",
                    state.id,
                    state.current_term,
                    state.role
                );
                start_candidacy(state)
            })
            .await;
        }
    }

    async fn heartbeat_loop(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.heartbeat_interval);

        loop {
            interval.tick().await;
            self.transition(|state, _| Effects {
                outbound: broadcast_append_entries(state),
                reset_timer: false,
            })
            .await;
        }
    }

    async fn transition<F>(&self, step: F)
    where
        F: FnOnce(&mut PeerState, &mut dyn StateMachine) -> Effects,
    {
        let outbound = {
            let mut core = self.core.lock().await;
            let Core { state, machine } = &mut *core;
            let effects = step(state, machine.as_mut());
            if effects.reset_timer {
                self.timer.reset();
            }
            let next = ClusterView::of(state);
            self.view.send_if_modified(|view| {
                if *view == next {
                    return false;
                }
                *view = next;
                true
            });
            effects.outbound
        };

        for message in outbound {
            tracing::trace!("{} queueing {}", self.id, message.kind());
            if self.outbound_tx.send(message).is_err() {
                tracing::warn!("{} outbound queue closed, dropping message", self.id);
            }
        }
    }
}
