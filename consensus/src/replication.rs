use std::net::SocketAddr;

use crate::{
    AppendEntries, AppendEntriesReply, AppendMode, ClientCommand, CommandReply, Effects, LogEntry,
    LogIndex, Message, NodeId, PeerState, Role, StateMachine,
};

/// Reply to a leader query (empty command list) sent to the leader.
pub const IS_LEADER: &str = "is_leader";
/// Reply to any client command sent to a peer that is not the leader.
pub const NOT_LEADER: &str = "not_leader";

/// Builds the next `AppendEntries` for `peer` from its replication cursor.
///
/// A follower that is caught up gets an empty heartbeat; otherwise it gets
/// every entry from `next_index` to the end of the log.
pub fn append_entries_for(state: &PeerState, peer: NodeId) -> AppendEntries {
    let len = state.log.len() as LogIndex;
    let next = state.next_index.get(&peer).copied().unwrap_or(len).min(len);
    let prev_log_index = next.checked_sub(1);
    let prev_log_term = prev_log_index
        .and_then(|index| state.term_at(index))
        .unwrap_or(0);
    let entries: Vec<LogEntry> = state.log[next as usize..]
        .iter()
        .map(LogEntry::replica)
        .collect();
    let mode = if entries.is_empty() {
        AppendMode::Heartbeat
    } else {
        AppendMode::Append
    };

    AppendEntries {
        term: state.current_term,
        leader_id: state.id,
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit_index: state.commit_index,
        mode,
        send_from: state.id,
        send_to: peer,
    }
}

/// One `AppendEntries` per peer, or nothing if this peer is not leading.
pub fn broadcast_append_entries(state: &PeerState) -> Vec<Message> {
    if state.role != Role::Leader {
        return Vec::new();
    }
    state
        .peers
        .iter()
        .map(|peer| Message::AppendEntries(append_entries_for(state, *peer)))
        .collect()
}

/// Follower side of `AppendEntries`, after the term gate.
pub fn handle_append_entries(
    state: &mut PeerState,
    machine: &mut dyn StateMachine,
    request: AppendEntries,
) -> Effects {
    let mut effects = Effects {
        reset_timer: true,
        ..Effects::default()
    };
    state.follow(request.leader_id);

    let reply = |state: &PeerState, success, range: Option<(LogIndex, LogIndex)>, match_index| {
        Message::AppendEntriesReply(AppendEntriesReply {
            term: state.current_term,
            success,
            log_index_start: range.map(|(start, _)| start),
            log_index_end: range.map(|(_, end)| end),
            match_index,
            send_from: state.id,
            send_to: request.send_from,
        })
    };

    if let Some(prev) = request.prev_log_index {
        if state.term_at(prev) != Some(request.prev_log_term) {
            tracing::debug!(
                "{} log does not match at index {} term {} (log length {})",
                state.id,
                prev,
                request.prev_log_term,
                state.log.len()
            );
            effects.send(reply(state, false, None, None));
            return effects;
        }
    }

    let first = request.prev_log_index.map_or(0, |prev| prev + 1);
    for (offset, entry) in request.entries.iter().enumerate() {
        let index = first + offset as LogIndex;
        let conflict = match state.log.get(index as usize) {
            Some(existing) if existing.term == entry.term => continue,
            Some(_) => true,
            None => false,
        };
        if conflict {
            truncate_from(state, index);
        }
        let mut accepted = entry.replica();
        accepted.index = index;
        state.log.push(accepted);
    }

    let count = request.entries.len() as LogIndex;
    let range = (count > 0).then(|| (first, first + count - 1));
    let matched = range.map(|(_, end)| end).or(request.prev_log_index);

    if let (Some(leader_commit), Some(matched)) = (request.leader_commit_index, matched) {
        apply_through(state, machine, leader_commit.min(matched));
    }

    effects.send(reply(state, true, range, matched));
    effects
}

fn truncate_from(state: &mut PeerState, index: LogIndex) {
    debug_assert!(
        state.log[index as usize..].iter().all(|entry| !entry.applied),
        "truncating an applied entry at index {}",
        index
    );
    tracing::debug!(
        "{} truncating conflicting entries from index {} (log length {})",
        state.id,
        index,
        state.log.len()
    );
    state.log.truncate(index as usize);
}

/// Leader side of an `AppendEntries` reply.
pub fn handle_append_entries_reply(
    state: &mut PeerState,
    machine: &mut dyn StateMachine,
    reply: AppendEntriesReply,
) -> Effects {
    let mut effects = Effects::none();

    if state.role != Role::Leader || reply.term != state.current_term {
        return effects;
    }
    let peer = reply.send_from;
    let Some(next) = state.next_index.get(&peer).copied() else {
        tracing::warn!("{} append reply from unknown peer {}", state.id, peer);
        return effects;
    };

    if !reply.success {
        // Linear back-off; the next heartbeat cycle retries from here.
        let backed_off = next.saturating_sub(1);
        tracing::debug!("{} next_index for {}: {} -> {}", state.id, peer, next, backed_off);
        state.next_index.insert(peer, backed_off);
        return effects;
    }

    let old = state.match_index.get(&peer).copied().flatten();
    let new = reply
        .match_index
        .and_then(|index| state.last_log_index().map(|last| index.min(last)));

    if let Some(new_match) = new.filter(|_| new > old) {
        let from = old.map_or(0, |index| index + 1);
        for entry in &mut state.log[from as usize..=new_match as usize] {
            entry.replicated_count += 1;
        }
        state.match_index.insert(peer, Some(new_match));
    }

    let floor = state
        .match_index
        .get(&peer)
        .copied()
        .flatten()
        .map_or(0, |index| index + 1);
    state.next_index.insert(peer, next.max(floor));

    effects.outbound.extend(advance_commit(state, machine));
    effects
}

/// Applies every entry up to the highest current-term entry held by a
/// majority, in index order, and answers the clients waiting on them.
fn advance_commit(state: &mut PeerState, machine: &mut dyn StateMachine) -> Vec<Message> {
    let majority = state.majority();
    let start = state.commit_index.map_or(0, |index| index + 1) as usize;
    if start >= state.log.len() {
        return Vec::new();
    }

    let term = state.current_term;
    let Some(offset) = state.log[start..]
        .iter()
        .rposition(|entry| entry.term == term && entry.replicas() >= majority)
    else {
        return Vec::new();
    };
    let target = (start + offset) as LogIndex;

    apply_through(state, machine, target)
        .into_iter()
        .filter_map(|(origin, result)| {
            origin.map(|client| {
                Message::CommandReply(CommandReply {
                    command_result: result,
                    send_from: state.id,
                    send_to: client,
                })
            })
        })
        .collect()
}

/// Applies unapplied entries through `upto` and returns each origin with
/// its result.
fn apply_through(
    state: &mut PeerState,
    machine: &mut dyn StateMachine,
    upto: LogIndex,
) -> Vec<(Option<SocketAddr>, String)> {
    let Some(last) = state.last_log_index() else {
        return Vec::new();
    };
    let upto = upto.min(last);
    let start = state.commit_index.map_or(0, |index| index + 1);

    let mut results = Vec::new();
    for index in start..=upto {
        let entry = &mut state.log[index as usize];
        debug_assert!(!entry.applied, "log index {} applied twice", index);
        if entry.applied {
            continue;
        }
        if entry.is_noop() {
            entry.applied = true;
            state.commit_index = Some(index);
            continue;
        }
        let result = machine.apply(&entry.command);
        entry.applied = true;
        results.push((entry.origin, result));
        state.commit_index = Some(index);
    }

    if !results.is_empty() {
        tracing::info!(
            "{} applied through index {} in term {} as {:?}",
            state.id,
            upto,
            state.current_term,
            state.role
        );
    }
    results
}

/// Client submissions. The leader appends commands to its log; an empty
/// list is a leader query. Other peers answer `not_leader`.
pub fn handle_client_command(
    state: &mut PeerState,
    machine: &mut dyn StateMachine,
    command: ClientCommand,
) -> Effects {
    let mut effects = Effects::none();
    let origin = command.send_from;

    let answer = |state: &PeerState, result: &str| {
        origin.map(|client| {
            Message::CommandReply(CommandReply {
                command_result: result.to_string(),
                send_from: state.id,
                send_to: client,
            })
        })
    };

    if state.role != Role::Leader {
        effects.outbound.extend(answer(state, NOT_LEADER));
        return effects;
    }
    if command.commands.is_empty() {
        effects.outbound.extend(answer(state, IS_LEADER));
        return effects;
    }

    match state.append_local(command.commands, origin) {
        Ok(index) => {
            tracing::debug!("{} appended client command at index {}", state.id, index);
            effects.outbound.extend(advance_commit(state, machine));
        }
        Err(e) => {
            tracing::warn!("{} failed to append client command: {}", state.id, e);
        }
    }
    effects
}
