use crate::Command;

/// The replicated state machine that committed commands are applied to.
///
/// `apply` is called exactly once per committed log index, in increasing
/// index order, while the node's state lock is held. It must not block.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &Command) -> String;
}
