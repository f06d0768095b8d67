//! # replication
//!
//! why: track how far each member's log matches the leader's
//! relations: created by node.rs on becoming leader, dropped on step-down
//! what: Progress per member, conflict backoff, majority commit index

use std::collections::BTreeMap;

use crate::{Log, LogIndex, NodeId, Term};

/// Leader-side view of one member's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next index to send.
    pub next_index: LogIndex,
    /// Highest index known to be replicated, `None` before the first match.
    pub match_index: Option<LogIndex>,
}

impl Progress {
    fn floor(&self) -> LogIndex {
        self.match_index.map_or(0, |m| m + 1)
    }
}

/// `nextIndex`/`matchIndex` for every member, the leader included.
#[derive(Debug, Clone)]
pub struct ReplicationTracker {
    progress: BTreeMap<NodeId, Progress>,
}

impl ReplicationTracker {
    pub fn new(leader: NodeId, members: &[NodeId], log: &Log) -> Self {
        let progress = members
            .iter()
            .map(|&id| {
                let match_index = if id == leader { log.last_index() } else { None };
                (
                    id,
                    Progress {
                        next_index: log.len(),
                        match_index,
                    },
                )
            })
            .collect();
        Self { progress }
    }

    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    /// Record a successful append up to `matched`.
    pub fn record_success(&mut self, id: NodeId, matched: Option<LogIndex>, log_len: u64) {
        let Some(p) = self.progress.get_mut(&id) else {
            return;
        };
        p.match_index = p.match_index.max(matched);
        let next = matched.map_or(0, |m| m + 1);
        p.next_index = p.next_index.max(next).min(log_len).max(p.floor());
    }

    /// Move `next_index` back after a log-matching failure. Returns the new value.
    pub fn record_conflict(
        &mut self,
        id: NodeId,
        conflict_index: Option<LogIndex>,
        conflict_term: Option<Term>,
        log: &Log,
    ) -> Option<LogIndex> {
        let p = self.progress.get_mut(&id)?;
        let hinted = match (conflict_term, conflict_index) {
            (Some(term), index) => log
                .last_index_of_term(term)
                .map(|last| last + 1)
                .or(index),
            (None, Some(index)) => Some(index),
            (None, None) => None,
        };
        let stepped = p.next_index.saturating_sub(1);
        let next = hinted.map_or(stepped, |h| h.min(stepped));
        p.next_index = next.max(p.floor()).min(log.len());
        Some(p.next_index)
    }

    /// Leader's own progress after a local append.
    pub fn record_local_append(&mut self, id: NodeId, log: &Log) {
        if let Some(p) = self.progress.get_mut(&id) {
            p.match_index = log.last_index();
            p.next_index = log.len();
        }
    }

    /// The highest index replicated on a majority: the value at rank
    /// `members / 2` of the match indices sorted descending.
    pub fn majority_match(&self) -> Option<LogIndex> {
        let mut matched: Vec<Option<LogIndex>> =
            self.progress.values().map(|p| p.match_index).collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched.get(matched.len() / 2).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Progress)> {
        self.progress.iter()
    }
}
