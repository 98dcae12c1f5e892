mod kv;

pub use kv::{KvStore, Operation, Variable};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid arguments for {command}: expected {expected}, got {got}")]
    InvalidArguments {
        command: String,
        expected: usize,
        got: usize,
    },
}
