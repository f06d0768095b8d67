//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, serialized by any transport
//! what: RequestVote and AppendEntries requests/responses, Envelope addressing

use serde::{Deserialize, Serialize};

use crate::{LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    /// `None` when the candidate's log is empty.
    pub last_log_index: Option<LogIndex>,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries. Doubles as the heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Index immediately preceding `entries`, `None` when they start at 0.
    pub prev_log_index: Option<LogIndex>,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Option<LogIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Last index known to match the leader's log. Set on success.
    pub matched_index: Option<LogIndex>,
    /// Where the leader should resume. Set on a log-matching failure.
    pub conflict_index: Option<LogIndex>,
    /// Term of the follower's conflicting entry, if it had one.
    pub conflict_term: Option<Term>,
}

impl AppendEntriesResponse {
    pub(crate) fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            matched_index: None,
            conflict_index: None,
            conflict_term: None,
        }
    }
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// The term carried by the message.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            RaftMessage::RequestVoteResponse(_) | RaftMessage::AppendEntriesResponse(_)
        )
    }
}

/// A message addressed from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}
