//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime, persisted through raft-storage
//! what: state machine, election logic, log management, message types

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod ready;
pub mod replication;
pub mod timer;

/// Stable identifier of a cluster member.
pub type NodeId = u64;

/// Election epoch. Never decreases on a node.
pub type Term = u64;

/// Zero-based position in the log.
pub type LogIndex = u64;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::{Log, LogEntry};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
pub use node::{RaftNode, Role};
pub use ready::{CommittedEntry, HardState, LogDelta, Ready};
pub use replication::{Progress, ReplicationTracker};
pub use timer::{TimerCommand, TimerKind, TimerToken};
