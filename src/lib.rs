pub mod config;
pub mod error;
pub mod node;

pub use config::Config;
pub use error::{RaftPeerError, Result};
pub use node::Node;

// Re-export key types from workspace crates
pub use consensus;
pub use network;
pub use storage;
