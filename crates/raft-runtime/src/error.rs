//! # error
//!
//! why: one error type for callers of a running node
//! relations: wraps raft-core and raft-storage errors, returned by actor.rs
//! what: RuntimeError enum and Result alias

use raft_core::RaftError;
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The node's actor task has exited.
    #[error("node has stopped")]
    NodeStopped,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
