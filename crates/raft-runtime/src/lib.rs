//! # raft-runtime
//!
//! why: drive the sans-io raft core with real time, real storage and a transport
//! relations: runs raft-core nodes, persists through raft-storage
//! what: tokio actor per node, Transport and StateMachine seams, LocalNetwork

pub mod actor;
pub mod error;
pub mod state_machine;
pub mod transport;

pub use actor::{spawn_node, start_node, NodeHandle, NodeStatus};
pub use error::{Result, RuntimeError};
pub use state_machine::{ApplyChannel, StateMachine};
pub use transport::{LocalNetwork, Transport};
