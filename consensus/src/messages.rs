use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{Command, LogEntry, LogIndex, NodeId, Term};

/// Every record exchanged between peers and clients.
///
/// The `msg_type` tag carries the wire name of each kind; the remaining
/// fields are flattened into the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum Message {
    #[serde(rename = "request_vote")]
    RequestVote(RequestVote),
    #[serde(rename = "request_vote_reply")]
    RequestVoteReply(RequestVoteReply),
    #[serde(rename = "append_entries_leader")]
    AppendEntries(AppendEntries),
    #[serde(rename = "append_entries_follower_reply")]
    AppendEntriesReply(AppendEntriesReply),
    #[serde(rename = "request_command")]
    ClientCommand(ClientCommand),
    #[serde(rename = "request_command_reply")]
    CommandReply(CommandReply),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Option<LogIndex>,
    pub last_log_term: Term,
    pub send_from: NodeId,
    pub send_to: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
    pub send_from: NodeId,
    pub send_to: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendMode {
    Heartbeat,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Option<LogIndex>,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: Option<LogIndex>,
    pub mode: AppendMode,
    pub send_from: NodeId,
    pub send_to: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    #[serde(rename = "append_entries_result")]
    pub success: bool,
    pub log_index_start: Option<LogIndex>,
    pub log_index_end: Option<LogIndex>,
    /// Highest index known to match the leader's log after this request.
    pub match_index: Option<LogIndex>,
    pub send_from: NodeId,
    pub send_to: NodeId,
}

/// A client submission. An empty command list is a leader query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommand {
    #[serde(rename = "request_command_list")]
    pub commands: Command,
    #[serde(default)]
    pub send_from: Option<SocketAddr>,
    #[serde(default)]
    pub send_to: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub command_result: String,
    pub send_from: NodeId,
    pub send_to: SocketAddr,
}

/// Where an outbound message has to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Peer(NodeId),
    Client(SocketAddr),
}

impl Message {
    /// Term carried by peer traffic; client traffic carries none.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::RequestVote(m) => Some(m.term),
            Message::RequestVoteReply(m) => Some(m.term),
            Message::AppendEntries(m) => Some(m.term),
            Message::AppendEntriesReply(m) => Some(m.term),
            Message::ClientCommand(_) | Message::CommandReply(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteReply(_) => "request_vote_reply",
            Message::AppendEntries(_) => "append_entries_leader",
            Message::AppendEntriesReply(_) => "append_entries_follower_reply",
            Message::ClientCommand(_) => "request_command",
            Message::CommandReply(_) => "request_command_reply",
        }
    }

    pub fn recipient(&self) -> Option<Recipient> {
        match self {
            Message::RequestVote(m) => Some(Recipient::Peer(m.send_to)),
            Message::RequestVoteReply(m) => Some(Recipient::Peer(m.send_to)),
            Message::AppendEntries(m) => Some(Recipient::Peer(m.send_to)),
            Message::AppendEntriesReply(m) => Some(Recipient::Peer(m.send_to)),
            Message::CommandReply(m) => Some(Recipient::Client(m.send_to)),
            Message::ClientCommand(m) => m.send_to.map(Recipient::Client),
        }
    }
}
