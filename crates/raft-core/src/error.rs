//! # error
//!
//! why: give callers of the core a typed rejection instead of silent no-ops
//! relations: returned by node.rs and config.rs, wrapped by raft-runtime
//! what: RaftError enum and the crate-wide Result alias

use thiserror::Error;

use crate::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// A command was submitted to a node that is not the leader.
    #[error("not the leader, current leader is node {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node {0} is not a member of the cluster")]
    UnknownMember(NodeId),
}

pub type Result<T> = std::result::Result<T, RaftError>;
