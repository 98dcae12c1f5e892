use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::{Command, ConsensusError, LogEntry, LogIndex, NodeId, Result, Term};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

/// Consensus state of one peer.
///
/// Owned by a single `PeerNode` and only ever touched under its state lock;
/// every method here is one step of a logical transition performed by a
/// message handler.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub current_term: Term,
    pub role: Role,
    pub voted_for: Option<NodeId>,
    /// Leader whose entries were accepted in the current term.
    pub leader_id: Option<NodeId>,
    pub log: Vec<LogEntry>,
    pub leader_vote_count: u32,
    votes_from: HashSet<NodeId>,
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, Option<LogIndex>>,
    /// Highest applied index. Entries at or below it are all applied.
    pub commit_index: Option<LogIndex>,
}

impl PeerState {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            id,
            peers: peers.into_iter().filter(|peer| *peer != id).collect(),
            current_term: 0,
            role: Role::default(),
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            leader_vote_count: 0,
            votes_from: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            commit_index: None,
        }
    }

    pub fn total_peers(&self) -> usize {
        self.peers.len() + 1
    }

    /// `floor(total_peers / 2) + 1`
    pub fn majority(&self) -> u32 {
        (self.total_peers() / 2 + 1) as u32
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn last_log_index(&self) -> Option<LogIndex> {
        self.log.last().map(|entry| entry.index)
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map_or(0, |entry| entry.term)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.log.get(index as usize).map(|entry| entry.term)
    }

    /// Moves to `seen_term` if it is newer, stepping down to follower.
    /// Returns true when the term advanced; the caller resets the election
    /// timer in that case.
    pub fn advance_term_if_newer(&mut self, seen_term: Term) -> bool {
        if seen_term <= self.current_term {
            return false;
        }
        tracing::debug!(
            "{} advancing term {} -> {}, stepping down from {:?}",
            self.id,
            self.current_term,
            seen_term,
            self.role
        );
        self.current_term = seen_term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.leader_id = None;
        self.leader_vote_count = 0;
        self.votes_from.clear();
        true
    }

    pub fn is_stale(&self, seen_term: Term) -> bool {
        seen_term < self.current_term
    }

    /// Decides a vote for `candidate`. Within one term the first eligible
    /// candidate wins; asking again as the same candidate is granted again
    /// without changing anything.
    pub fn grant_vote(
        &mut self,
        candidate: NodeId,
        requested_term: Term,
        last_log_index: Option<LogIndex>,
        last_log_term: Term,
    ) -> bool {
        if requested_term < self.current_term {
            return false;
        }
        if self.voted_for.is_some_and(|voted| voted != candidate) {
            return false;
        }
        // A follower that already accepted this term's leader must not help
        // elect a second one, even though accepting entries cleared its vote.
        if self.leader_id.is_some_and(|leader| leader != candidate) {
            return false;
        }
        if !self.candidate_log_is_current(last_log_index, last_log_term) {
            return false;
        }
        self.voted_for = Some(candidate);
        true
    }

    fn candidate_log_is_current(&self, last_log_index: Option<LogIndex>, last_log_term: Term) -> bool {
        let theirs = (last_log_term, last_log_index.map_or(0, |index| index + 1));
        let ours = (self.last_log_term(), self.log.len() as u64);
        theirs >= ours
    }

    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_from.clear();
        self.votes_from.insert(self.id);
        self.leader_vote_count = 1;
        tracing::info!("{} became candidate for term {}", self.id, self.current_term);
    }

    /// Counts a granted vote once per voter. Returns whether it was new.
    pub fn record_vote(&mut self, voter: NodeId) -> bool {
        let fresh = self.votes_from.insert(voter);
        self.leader_vote_count = self.votes_from.len() as u32;
        fresh
    }

    pub fn has_majority_votes(&self) -> bool {
        self.leader_vote_count >= self.majority()
    }

    pub fn become_leader(&mut self) -> Result<()> {
        if self.role != Role::Candidate {
            return Err(ConsensusError::InvalidTransition {
                from: self.role,
                to: Role::Leader,
            });
        }
        self.role = Role::Leader;
        self.leader_id = Some(self.id);

        let next = self.log.len() as LogIndex;
        self.next_index = self.peers.iter().map(|peer| (*peer, next)).collect();
        self.match_index = self.peers.iter().map(|peer| (*peer, None)).collect();

        tracing::info!(
            "{} became leader for term {} with {} votes",
            self.id,
            self.current_term,
            self.leader_vote_count
        );
        Ok(())
    }

    /// Steps down after accepting entries from the current term's leader.
    pub fn follow(&mut self, leader: NodeId) {
        if self.role != Role::Follower {
            tracing::info!("{} following {} in term {}", self.id, leader, self.current_term);
        }
        self.role = Role::Follower;
        self.voted_for = None;
        self.leader_id = Some(leader);
    }

    pub fn append_local(&mut self, command: Command, origin: Option<SocketAddr>) -> Result<LogIndex> {
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader(self.leader_id));
        }
        let index = self.log.len() as LogIndex;
        self.log
            .push(LogEntry::new(index, self.current_term, command, origin));
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn three_peer_state() -> PeerState {
        PeerState::new(node(1), vec![node(1), node(2), node(3)])
    }

    #[test]
    fn new_state_is_empty_follower() {
        let state = three_peer_state();
        assert_eq!(state.role, Role::Follower);
        assert_eq!(Role::default(), Role::Follower);
        assert_eq!(state.current_term, 0);
        assert!(state.log.is_empty());
        assert_eq!(state.peers, vec![node(2), node(3)]);
        assert_eq!(state.majority(), 2);
    }

    #[test]
    fn majority_threshold() {
        assert_eq!(PeerState::new(node(1), vec![]).majority(), 1);
        assert_eq!(PeerState::new(node(1), vec![node(2)]).majority(), 2);
        assert_eq!(
            PeerState::new(node(1), vec![node(2), node(3), node(4), node(5)]).majority(),
            3
        );
    }

    #[test]
    fn newer_term_demotes_and_clears_vote() {
        let mut state = three_peer_state();
        state.become_candidate();
        assert!(state.advance_term_if_newer(3));
        assert_eq!(state.current_term, 3);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.leader_vote_count, 0);
        assert!(!state.advance_term_if_newer(3));
        assert!(!state.advance_term_if_newer(2));
        assert!(state.is_stale(2));
        assert!(!state.is_stale(3));
    }

    #[test]
    fn first_candidate_wins_the_term() {
        let mut state = three_peer_state();
        state.advance_term_if_newer(5);
        assert!(state.grant_vote(node(2), 5, None, 0));
        assert!(!state.grant_vote(node(3), 5, None, 0));
        assert_eq!(state.voted_for, Some(node(2)));
    }

    #[test]
    fn repeated_grant_is_a_no_op() {
        let mut state = three_peer_state();
        state.advance_term_if_newer(2);
        assert!(state.grant_vote(node(2), 2, None, 0));
        let voted = state.voted_for;
        let term = state.current_term;
        assert!(state.grant_vote(node(2), 2, None, 0));
        assert_eq!(state.voted_for, voted);
        assert_eq!(state.current_term, term);
    }

    #[test]
    fn stale_log_is_denied() {
        let mut state = three_peer_state();
        state.log.push(LogEntry::new(0, 2, vec!["set".into()], None));
        state.log.push(LogEntry::new(1, 2, vec!["set".into()], None));
        state.advance_term_if_newer(3);

        assert!(!state.grant_vote(node(2), 3, Some(0), 2));
        assert!(!state.grant_vote(node(2), 3, Some(5), 1));
        assert!(state.grant_vote(node(3), 3, Some(0), 3));
    }

    #[test]
    fn known_leader_blocks_same_term_votes() {
        let mut state = three_peer_state();
        state.advance_term_if_newer(4);
        state.follow(node(2));
        assert_eq!(state.voted_for, None);
        assert!(!state.grant_vote(node(3), 4, None, 0));
    }

    #[test]
    fn leader_only_from_candidate() {
        let mut state = three_peer_state();
        assert!(matches!(
            state.become_leader(),
            Err(ConsensusError::InvalidTransition { .. })
        ));

        state.log.push(LogEntry::new(0, 0, vec![], None));
        state.become_candidate();
        state.record_vote(node(2));
        assert!(state.has_majority_votes());
        state.become_leader().unwrap();
        assert_eq!(state.next_index[&node(2)], 1);
        assert_eq!(state.match_index[&node(3)], None);
    }

    #[test]
    fn duplicate_votes_count_once() {
        let mut state = PeerState::new(node(1), vec![node(2), node(3), node(4), node(5)]);
        state.become_candidate();
        assert!(state.record_vote(node(2)));
        assert!(!state.record_vote(node(2)));
        assert_eq!(state.leader_vote_count, 2);
        assert!(!state.has_majority_votes());
    }

    #[test]
    fn append_requires_leadership() {
        let mut state = three_peer_state();
        assert!(matches!(
            state.append_local(vec!["set".into()], None),
            Err(ConsensusError::NotLeader(None))
        ));
        state.become_candidate();
        state.record_vote(node(2));
        state.become_leader().unwrap();
        assert_eq!(state.append_local(vec!["set".into()], None).unwrap(), 0);
        assert_eq!(state.append_local(vec!["get".into()], None).unwrap(), 1);
        assert_eq!(state.log[1].term, 1);
        assert_eq!(state.log[1].replicated_count, 0);
    }
}
