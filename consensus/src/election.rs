use crate::replication::broadcast_append_entries;
use crate::{Effects, LogEntry, LogIndex, Message, PeerState, RequestVote, RequestVoteReply, Role};

/// Election timeout path: campaign for the next term.
///
/// A peer with no others in the cluster wins on its own vote.
pub fn start_candidacy(state: &mut PeerState) -> Effects {
    state.become_candidate();

    let mut effects = Effects {
        reset_timer: true,
        ..Effects::default()
    };

    if state.has_majority_votes() {
        claim_leadership(state, &mut effects);
        return effects;
    }

    for peer in &state.peers {
        effects.send(Message::RequestVote(RequestVote {
            term: state.current_term,
            candidate_id: state.id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
            send_from: state.id,
            send_to: *peer,
        }));
    }
    effects
}

/// Voter side of `RequestVote`, after the term gate.
pub fn handle_request_vote(state: &mut PeerState, request: RequestVote) -> Effects {
    let granted = state.grant_vote(
        request.candidate_id,
        request.term,
        request.last_log_index,
        request.last_log_term,
    );
    tracing::debug!(
        "{} vote for {} in term {}: granted={}",
        state.id,
        request.candidate_id,
        state.current_term,
        granted
    );

    let mut effects = Effects {
        reset_timer: granted,
        ..Effects::default()
    };
    effects.send(Message::RequestVoteReply(RequestVoteReply {
        term: state.current_term,
        vote_granted: granted,
        send_from: state.id,
        send_to: request.send_from,
    }));
    effects
}

/// Candidate side: tally a vote and take over once a majority is reached.
pub fn handle_request_vote_reply(state: &mut PeerState, reply: RequestVoteReply) -> Effects {
    let mut effects = Effects::none();

    if state.role != Role::Candidate || reply.term != state.current_term {
        tracing::debug!(
            "{} ignoring vote from {} for term {} as {:?} in term {}",
            state.id,
            reply.send_from,
            reply.term,
            state.role,
            state.current_term
        );
        return effects;
    }
    if !reply.vote_granted {
        tracing::debug!("{} vote denied by {}", state.id, reply.send_from);
        return effects;
    }

    if state.record_vote(reply.send_from) && state.has_majority_votes() {
        claim_leadership(state, &mut effects);
    }
    effects
}

/// Takes leadership and announces it. Entries from earlier terms can only
/// commit behind an entry of the new term, so a leader holding uncommitted
/// entries appends a no-op first.
fn claim_leadership(state: &mut PeerState, effects: &mut Effects) {
    if let Err(e) = state.become_leader() {
        tracing::warn!("{} could not take leadership: {}", state.id, e);
        return;
    }
    if state.last_log_index() > state.commit_index {
        let index = state.log.len() as LogIndex;
        state.log.push(LogEntry::noop(index, state.current_term));
        tracing::debug!(
            "{} appended no-op at index {} to commit entries from earlier terms",
            state.id,
            index
        );
    }
    effects.outbound.extend(broadcast_append_entries(state));
}
