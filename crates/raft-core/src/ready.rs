//! # ready
//!
//! why: the core performs no i/o, so every effect is handed to the driver
//! relations: filled by node.rs, drained by raft-runtime, persisted by raft-storage
//! what: Ready outbox, HardState, LogDelta, CommittedEntry

use serde::{Deserialize, Serialize};

use crate::{Envelope, LogEntry, LogIndex, NodeId, Term, TimerCommand, TimerKind};

/// State that must be durable before the node answers any RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Log mutation since the last drain: truncate at `from`, then append `entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDelta {
    pub from: LogIndex,
    pub entries: Vec<LogEntry>,
}

/// A committed entry ready for the application, with its log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: LogIndex,
    pub entry: LogEntry,
}

/// Everything a node produced while handling events.
///
/// Drivers must persist `hard_state` and `log_delta` before sending `messages`.
#[derive(Debug, Default)]
pub struct Ready {
    pub hard_state: Option<HardState>,
    pub log_delta: Option<LogDelta>,
    pub messages: Vec<Envelope>,
    pub timers: Vec<TimerCommand>,
    pub committed: Vec<CommittedEntry>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none()
            && self.log_delta.is_none()
            && self.messages.is_empty()
            && self.timers.is_empty()
            && self.committed.is_empty()
    }

    /// The last timer instruction per timer kind, in issue order.
    pub fn latest_timers(&self) -> impl Iterator<Item = &TimerCommand> {
        self.timers.iter().enumerate().filter_map(|(i, cmd)| {
            let kind = timer_kind(cmd);
            let superseded = self.timers[i + 1..].iter().any(|c| timer_kind(c) == kind);
            (!superseded).then_some(cmd)
        })
    }
}

fn timer_kind(cmd: &TimerCommand) -> TimerKind {
    match *cmd {
        TimerCommand::Arm { kind, .. } | TimerCommand::Cancel { kind } => kind,
    }
}
