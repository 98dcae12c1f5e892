use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{LogIndex, Term};

/// A client command, e.g. `["set", "x", "1"]`. Opaque to consensus.
pub type Command = Vec<String>;

/// One replicated command plus the leader's commit bookkeeping.
///
/// `index`, `term` and `command` never change once the entry is appended.
/// `replicated_count` and `applied` are local to each peer and are not sent
/// over the wire: a follower always receives an entry with both reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
    /// Client address waiting for the apply result, if the entry was
    /// submitted to this cluster's leader by a connected client.
    pub origin: Option<SocketAddr>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub replicated_count: u32,
    #[serde(skip)]
    pub applied: bool,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Command, origin: Option<SocketAddr>) -> Self {
        Self {
            index,
            term,
            command,
            origin,
            timestamp: Utc::now(),
            replicated_count: 0,
            applied: false,
        }
    }

    /// Copies accepted by a follower start with fresh bookkeeping.
    pub fn replica(&self) -> Self {
        Self {
            replicated_count: 0,
            applied: false,
            ..self.clone()
        }
    }

    /// Entry with no command, appended by a new leader so that entries
    /// left over from earlier terms can commit. Never applied.
    pub fn noop(index: LogIndex, term: Term) -> Self {
        Self::new(index, term, Command::new(), None)
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }

    /// Replicas holding this entry, counting the leader itself.
    pub fn replicas(&self) -> u32 {
        self.replicated_count + 1
    }

    pub fn same_slot(&self, other: &LogEntry) -> bool {
        self.index == other.index && self.term == other.term
    }
}
