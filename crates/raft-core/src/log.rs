//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, persisted via raft-storage
//! what: LogEntry struct, Log with 0-based indexing, conflict lookups

use serde::{Deserialize, Serialize};

use crate::{LogIndex, Term};

/// A single entry in the replicated log. Its index is its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }
}

/// Ordered sequence of entries. Index 0 is the first entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry, `None` for an empty log.
    pub fn last_index(&self) -> Option<LogIndex> {
        self.len().checked_sub(1)
    }

    /// Term of the last entry, 0 for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.entries.get(usize::try_from(index).ok()?)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.get(index).map(|e| e.term)
    }

    /// Entries from `start` (inclusive) to the end.
    pub fn entries_from(&self, start: LogIndex) -> &[LogEntry] {
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        self.entries.get(start..).unwrap_or(&[])
    }

    /// Entries in `start..=end`, clamped to the log.
    pub fn slice(&self, start: LogIndex, end: LogIndex) -> &[LogEntry] {
        let from = entries_pos(start).min(self.entries.len());
        let to = entries_pos(end.saturating_add(1)).min(self.entries.len());
        self.entries.get(from..to).unwrap_or(&[])
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Append an entry and return its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.len() - 1
    }

    /// Drop every entry at or after `index`.
    pub fn truncate_from(&mut self, index: LogIndex) {
        self.entries.truncate(entries_pos(index));
    }

    /// First index holding an entry of `term`.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .position(|e| e.term == term)
            .map(|i| i as LogIndex)
    }

    /// Last index holding an entry of `term`.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rposition(|e| e.term == term)
            .map(|i| i as LogIndex)
    }
}

fn entries_pos(index: LogIndex) -> usize {
    usize::try_from(index).unwrap_or(usize::MAX)
}
