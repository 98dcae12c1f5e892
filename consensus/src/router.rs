use crate::election;
use crate::replication;
use crate::{Message, PeerState, RequestVoteReply, Role, StateMachine};

/// Output of one logical transition: the messages to hand to the transport
/// once the state lock is released, and whether the election timer must be
/// pushed back.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Message>,
    pub reset_timer: bool,
}

impl Effects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn send(&mut self, message: Message) {
        self.outbound.push(message);
    }

    pub fn absorb(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.reset_timer |= other.reset_timer;
    }
}

/// Applies the term gate to `message` and dispatches it to its handler.
///
/// Must be called with the node's state lock held; the returned effects
/// are carried out after the lock is released.
pub fn route(state: &mut PeerState, machine: &mut dyn StateMachine, message: Message) -> Effects {
    let mut effects = Effects::none();

    if let Some(term) = message.term() {
        if state.advance_term_if_newer(term) {
            effects.reset_timer = true;
        }
        if state.is_stale(term) {
            tracing::debug!(
                "{} dropping stale {} (term {} < {})",
                state.id,
                message.kind(),
                term,
                state.current_term
            );
            return effects;
        }
    }

    tracing::debug!("{} handling {} in term {}", state.id, message.kind(), state.current_term);

    let handled = match message {
        Message::RequestVote(request) => {
            if state.role != Role::Follower {
                // Same-term request while campaigning or leading.
                tracing::debug!(
                    "{} denying same-term vote to {} as {:?}",
                    state.id,
                    request.candidate_id,
                    state.role
                );
                let mut denied = Effects::none();
                denied.send(Message::RequestVoteReply(RequestVoteReply {
                    term: state.current_term,
                    vote_granted: false,
                    send_from: state.id,
                    send_to: request.send_from,
                }));
                denied
            } else {
                election::handle_request_vote(state, request)
            }
        }
        Message::RequestVoteReply(reply) => election::handle_request_vote_reply(state, reply),
        Message::AppendEntries(request) => replication::handle_append_entries(state, machine, request),
        Message::AppendEntriesReply(reply) => {
            replication::handle_append_entries_reply(state, machine, reply)
        }
        Message::ClientCommand(command) => replication::handle_client_command(state, machine, command),
        Message::CommandReply(reply) => {
            tracing::warn!(
                "{} ignoring request_command_reply addressed to {}",
                state.id,
                reply.send_to
            );
            Effects::none()
        }
    };

    effects.absorb(handled);
    effects
}
