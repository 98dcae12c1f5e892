mod election;
mod log;
mod machine;
mod messages;
mod node;
mod replication;
mod router;
mod state;
mod timer;

pub use election::{handle_request_vote, handle_request_vote_reply, start_candidacy};
pub use log::{Command, LogEntry};
pub use machine::StateMachine;
pub use messages::{
    AppendEntries, AppendEntriesReply, AppendMode, ClientCommand, CommandReply, Message, Recipient, RequestVote,
    RequestVoteReply,
};
pub use node::{ClusterView, PeerNode};
pub use replication::{
    append_entries_for, broadcast_append_entries, handle_append_entries, handle_append_entries_reply,
    handle_client_command, IS_LEADER, NOT_LEADER,
};
pub use router::{route, Effects};
pub use state::{PeerState, Role};
pub use timer::ElectionTimer;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Logical clock epoch shared by the cluster.
pub type Term = u64;

/// 0-based position of an entry in the replicated log.
pub type LogIndex = u64;

/// A peer is identified by the address its peer listener is bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub SocketAddr);

impl NodeId {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Config {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            id,
            peers: peers.into_iter().filter(|peer| *peer != id).collect(),
            election_timeout_min_ms: 100,
            election_timeout_max_ms: 150,
            heartbeat_interval_ms: 40,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Not leader: current leader is {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Invalid role transition from {from:?} to {to:?}")]
    InvalidTransition { from: Role, to: Role },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}
