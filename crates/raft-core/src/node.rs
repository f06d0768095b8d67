//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entries, replication.rs
//!            for leader bookkeeping, timer.rs for timer policy, ready.rs for output
//! what: Role enum, RaftNode with election, replication, commit and apply

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::{validate_membership, RaftConfig};
use crate::error::{RaftError, Result};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::ready::{CommittedEntry, HardState, LogDelta, Ready};
use crate::replication::{Progress, ReplicationTracker};
use crate::timer::{TimerKind, TimerToken, Timers};
use crate::{Log, LogEntry, LogIndex, NodeId, Term};

/// The three possible roles a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// A single Raft node in the cluster.
///
/// The node is a sans-io state machine: handlers mutate its state and queue
/// their effects, which the driver collects with [`RaftNode::take_ready`].
/// Events must be fed one at a time.
///
/// # Safety invariants
///
/// ## Election Safety
/// At most one leader per term: each node grants one vote per term
/// (`voted_for`) and a candidate needs a strict majority of the fixed cluster.
///
/// ## Log Matching
/// AppendEntries is accepted only when `prev_log_index`/`prev_log_term` match,
/// and a follower truncates only from the first conflicting entry onward.
///
/// ## Leader Completeness
/// Votes go only to candidates whose log is at least as up to date, and a
/// leader counts replicas only for entries of its own term.
///
/// ## State Machine Safety
/// Entries reach [`Ready::committed`] once, in index order, and never beyond
/// `commit_index`.
#[derive(Debug)]
pub struct RaftNode {
    id: NodeId,
    members: Vec<NodeId>,
    config: RaftConfig,

    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Log,

    commit_index: Option<LogIndex>,
    last_applied: Option<LogIndex>,

    votes_received: BTreeSet<NodeId>,
    replication: Option<ReplicationTracker>,

    timers: Timers,
    ready: Ready,
    persisted: HardState,
    log_dirty_from: Option<LogIndex>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state with the default config.
    pub fn new(id: NodeId, members: Vec<NodeId>) -> Result<Self> {
        Self::with_config(id, members, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, members: Vec<NodeId>, config: RaftConfig) -> Result<Self> {
        Self::restore(id, members, config, HardState::default(), Vec::new())
    }

    /// Rebuild a node from recovered durable state. Commit and apply progress
    /// are volatile and start empty.
    pub fn restore(
        id: NodeId,
        members: Vec<NodeId>,
        config: RaftConfig,
        hard_state: HardState,
        entries: Vec<LogEntry>,
    ) -> Result<Self> {
        config.validate()?;
        validate_membership(id, &members)?;

        let timers = Timers::new(
            config.election_timeout_min,
            config.election_timeout_max,
            config.heartbeat(),
            config.rng_seed,
        );
        let mut node = Self {
            id,
            members,
            config,
            role: Role::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            log: Log::from_entries(entries),
            commit_index: None,
            last_applied: None,
            votes_received: BTreeSet::new(),
            replication: None,
            timers,
            ready: Ready::default(),
            persisted: hard_state,
            log_dirty_from: None,
        };
        node.arm_election_timer();
        debug!(
            node_id = node.id,
            term = node.current_term,
            log_len = node.log.len(),
            "node created"
        );
        Ok(node)
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Leader known for the current term, if any.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit_index(&self) -> Option<LogIndex> {
        self.commit_index
    }

    pub fn last_applied(&self) -> Option<LogIndex> {
        self.last_applied
    }

    /// Votes gathered in the current election. Zero unless candidate.
    pub fn votes_received(&self) -> usize {
        self.votes_received.len()
    }

    /// Leader-side replication progress for `member`.
    pub fn progress(&self, member: NodeId) -> Option<Progress> {
        self.replication.as_ref()?.get(member).copied()
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    pub fn election_timer(&self) -> Option<TimerToken> {
        self.timers.election
    }

    pub fn heartbeat_timer(&self) -> Option<TimerToken> {
        self.timers.heartbeat_token
    }

    pub fn cluster_size(&self) -> usize {
        self.members.len()
    }

    /// Votes (or replicas) needed for a strict majority.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .copied()
            .filter(|&m| m != self.id)
            .collect()
    }

    // -- output --

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
            || self.log_dirty_from.is_some()
            || self.hard_state() != self.persisted
    }

    /// Drain everything produced since the last call.
    pub fn take_ready(&mut self) -> Ready {
        let mut ready = std::mem::take(&mut self.ready);
        let hard_state = self.hard_state();
        if hard_state != self.persisted {
            ready.hard_state = Some(hard_state);
            self.persisted = hard_state;
        }
        if let Some(from) = self.log_dirty_from.take() {
            ready.log_delta = Some(LogDelta {
                from,
                entries: self.log.entries_from(from).to_vec(),
            });
        }
        ready
    }

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.ready.messages.push(Envelope {
            from: self.id,
            to,
            message,
        });
    }

    fn mark_log_dirty(&mut self, from: LogIndex) {
        self.log_dirty_from = Some(self.log_dirty_from.map_or(from, |f| f.min(from)));
    }

    fn arm_election_timer(&mut self) {
        let cmd = self.timers.arm_election();
        self.ready.timers.push(cmd);
    }

    fn arm_heartbeat_timer(&mut self) {
        let cmd = self.timers.arm_heartbeat();
        self.ready.timers.push(cmd);
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(cmd) = self.timers.cancel(kind) {
            self.ready.timers.push(cmd);
        }
    }

    // -- events --

    /// Dispatch an inbound message to its handler.
    pub fn step(&mut self, envelope: Envelope) {
        if envelope.to != self.id || !self.members.contains(&envelope.from) {
            trace!(node_id = self.id, from = envelope.from, to = envelope.to, "dropping misaddressed message");
            return;
        }
        let from = envelope.from;
        match envelope.message {
            RaftMessage::RequestVote(req) => self.handle_request_vote(from, req),
            RaftMessage::RequestVoteResponse(resp) => self.handle_request_vote_response(from, resp),
            RaftMessage::AppendEntries(req) => self.handle_append_entries(from, req),
            RaftMessage::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, resp)
            }
        }
    }

    /// Election timer fired. Stale tokens and leaders ignore it.
    pub fn on_election_timeout(&mut self, token: TimerToken) {
        if !self.timers.is_current(TimerKind::Election, token) {
            trace!(node_id = self.id, ?token, "stale election timeout");
            return;
        }
        if self.role == Role::Leader {
            return;
        }
        self.start_election();
    }

    /// Heartbeat timer fired: broadcast AppendEntries and re-arm.
    pub fn on_heartbeat_tick(&mut self, token: TimerToken) {
        if self.role != Role::Leader || !self.timers.is_current(TimerKind::Heartbeat, token) {
            trace!(node_id = self.id, ?token, "stale heartbeat tick");
            return;
        }
        self.broadcast_append_entries();
        self.arm_heartbeat_timer();
    }

    /// Append a command to the leader's log and replicate it right away.
    pub fn append_log_entry(&mut self, command: impl Into<Vec<u8>>) -> Result<LogIndex> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        }
        let index = self.log.append(LogEntry::new(self.current_term, command));
        self.mark_log_dirty(index);
        if let Some(tracker) = self.replication.as_mut() {
            tracker.record_local_append(self.id, &self.log);
        }
        debug!(node_id = self.id, index, term = self.current_term, "appended command to log");

        self.broadcast_append_entries();
        self.advance_commit_index();
        Ok(index)
    }

    // -- role transitions --

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        let previous = self.role;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = leader;
        } else if leader.is_some() {
            self.voted_for = leader;
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.votes_received.clear();
        self.replication = None;
        self.cancel_timer(TimerKind::Heartbeat);
        self.arm_election_timer();

        info!(
            node_id = self.id,
            term = self.current_term,
            from = %previous,
            leader = ?leader,
            "became follower"
        );
    }

    /// Start a new election: bump the term, vote for self, ask every peer.
    pub fn start_election(&mut self) {
        if self.role == Role::Leader {
            return;
        }
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.arm_election_timer();

        info!(node_id = self.id, term = self.current_term, "starting election");

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers() {
            self.send(peer, RaftMessage::RequestVote(request.clone()));
        }

        if self.has_quorum() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        let votes = self.votes_received.len();
        self.votes_received.clear();
        self.cancel_timer(TimerKind::Election);
        self.replication = Some(ReplicationTracker::new(self.id, &self.members, &self.log));
        self.arm_heartbeat_timer();

        info!(node_id = self.id, term = self.current_term, votes, "became leader");

        self.broadcast_append_entries();
        self.advance_commit_index();
    }

    // -- request vote --

    /// Whether a candidate's log is at least as up to date as ours.
    pub fn candidate_log_ok(&self, last_log_index: Option<LogIndex>, last_log_term: Term) -> bool {
        last_log_index >= self.log.last_index()
            && (self.log.is_empty() || last_log_term >= self.log.last_term())
    }

    pub fn handle_request_vote(&mut self, from: NodeId, req: RequestVoteRequest) {
        if req.term < self.current_term {
            trace!(node_id = self.id, from, term = req.term, "rejecting stale vote request");
            self.reply_vote(from, false);
            return;
        }
        if req.term > self.current_term {
            self.become_follower(req.term, None);
        }

        let log_ok = self.candidate_log_ok(req.last_log_index, req.last_log_term);
        let free = self.voted_for.map_or(true, |v| v == req.candidate_id);
        let granted = free && log_ok;
        if granted {
            self.voted_for = Some(req.candidate_id);
            self.arm_election_timer();
            debug!(node_id = self.id, candidate = req.candidate_id, term = self.current_term, "granted vote");
        } else {
            debug!(
                node_id = self.id,
                candidate = req.candidate_id,
                term = self.current_term,
                log_ok,
                voted_for = ?self.voted_for,
                "denied vote"
            );
        }
        self.reply_vote(from, granted);
    }

    fn reply_vote(&mut self, to: NodeId, vote_granted: bool) {
        let response = RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        };
        self.send(to, RaftMessage::RequestVoteResponse(response));
    }

    pub fn handle_request_vote_response(&mut self, from: NodeId, resp: RequestVoteResponse) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None);
            return;
        }
        if self.role != Role::Candidate || resp.term != self.current_term {
            trace!(node_id = self.id, from, term = resp.term, "ignoring stale vote response");
            return;
        }
        if resp.vote_granted && self.votes_received.insert(from) {
            debug!(
                node_id = self.id,
                from,
                votes = self.votes_received.len(),
                needed = self.quorum_size(),
                "received vote"
            );
            if self.has_quorum() {
                self.become_leader();
            }
        }
    }

    // -- append entries --

    pub fn handle_append_entries(&mut self, from: NodeId, req: AppendEntriesRequest) {
        if req.term < self.current_term {
            trace!(node_id = self.id, from, term = req.term, "rejecting stale append entries");
            self.send(
                from,
                RaftMessage::AppendEntriesResponse(AppendEntriesResponse::rejected(
                    self.current_term,
                )),
            );
            return;
        }
        if req.term > self.current_term || self.role == Role::Candidate {
            self.become_follower(req.term, Some(req.leader_id));
        } else if self.role == Role::Leader {
            warn!(node_id = self.id, other = req.leader_id, term = req.term, "second leader in term");
            self.send(
                from,
                RaftMessage::AppendEntriesResponse(AppendEntriesResponse::rejected(
                    self.current_term,
                )),
            );
            return;
        } else {
            self.leader_id = Some(req.leader_id);
            self.arm_election_timer();
        }

        if let Some(prev) = req.prev_log_index {
            let conflict = match self.log.term_at(prev) {
                None => Some((self.log.len(), None)),
                Some(term) if term != req.prev_log_term => {
                    let first = self.log.first_index_of_term(term).unwrap_or(prev);
                    Some((first, Some(term)))
                }
                Some(_) => None,
            };
            if let Some((conflict_index, conflict_term)) = conflict {
                debug!(
                    node_id = self.id,
                    prev_log_index = prev,
                    conflict_index,
                    ?conflict_term,
                    "log mismatch"
                );
                let response = AppendEntriesResponse {
                    conflict_index: Some(conflict_index),
                    conflict_term,
                    ..AppendEntriesResponse::rejected(self.current_term)
                };
                self.send(from, RaftMessage::AppendEntriesResponse(response));
                return;
            }
        }

        let start = req.prev_log_index.map_or(0, |p| p + 1);
        let count = req.entries.len() as u64;
        let mismatch = req
            .entries
            .iter()
            .enumerate()
            .find(|(offset, entry)| self.log.term_at(start + *offset as u64) != Some(entry.term))
            .map(|(offset, _)| offset);

        if let Some(offset) = mismatch {
            let index = start + offset as u64;
            if Some(index) <= self.commit_index {
                warn!(node_id = self.id, index, "refusing to overwrite committed entry");
                self.send(
                    from,
                    RaftMessage::AppendEntriesResponse(AppendEntriesResponse::rejected(
                        self.current_term,
                    )),
                );
                return;
            }
            self.log.truncate_from(index);
            for entry in req.entries.into_iter().skip(offset) {
                self.log.append(entry);
            }
            self.mark_log_dirty(index);
        }

        let matched = if count == 0 {
            req.prev_log_index
        } else {
            Some(start + count - 1)
        };

        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(matched);
            if commit > self.commit_index {
                self.commit_index = commit;
                debug!(node_id = self.id, commit_index = ?commit, "follower commit advanced");
                self.apply_committed();
            }
        }

        let response = AppendEntriesResponse {
            term: self.current_term,
            success: true,
            matched_index: matched,
            conflict_index: None,
            conflict_term: None,
        };
        self.send(from, RaftMessage::AppendEntriesResponse(response));
    }

    pub fn handle_append_entries_response(&mut self, from: NodeId, resp: AppendEntriesResponse) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None);
            return;
        }
        if self.role != Role::Leader || resp.term != self.current_term || from == self.id {
            trace!(node_id = self.id, from, term = resp.term, "ignoring stale append response");
            return;
        }
        let log_len = self.log.len();
        let Some(tracker) = self.replication.as_mut() else {
            return;
        };

        if resp.success {
            tracker.record_success(from, resp.matched_index, log_len);
            self.advance_commit_index();
        } else {
            let next = tracker.record_conflict(from, resp.conflict_index, resp.conflict_term, &self.log);
            debug!(node_id = self.id, peer = from, next_index = ?next, "backing off after conflict");
            if next.is_some() {
                self.send_append_entries(from);
            }
        }
    }

    fn broadcast_append_entries(&mut self) {
        for peer in self.peers() {
            self.send_append_entries(peer);
        }
    }

    fn send_append_entries(&mut self, peer: NodeId) {
        let Some(progress) = self.progress(peer) else {
            return;
        };
        let prev_log_index = progress.next_index.checked_sub(1);
        let prev_log_term = prev_log_index
            .and_then(|i| self.log.term_at(i))
            .unwrap_or(0);
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(progress.next_index).to_vec(),
            leader_commit: self.commit_index,
        };
        self.send(peer, RaftMessage::AppendEntries(request));
    }

    // -- commit & apply --

    fn advance_commit_index(&mut self) {
        let Some(candidate) = self.replication.as_ref().and_then(|t| t.majority_match()) else {
            return;
        };
        if Some(candidate) <= self.commit_index {
            return;
        }
        // only entries of the current term are committed by counting replicas
        if self.log.term_at(candidate) != Some(self.current_term) {
            return;
        }
        self.commit_index = Some(candidate);
        debug!(node_id = self.id, commit_index = candidate, "leader commit advanced");
        self.apply_committed();
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied.map_or(0, |i| i + 1);
            let Some(entry) = self.log.get(next).cloned() else {
                warn!(node_id = self.id, index = next, "committed index missing from log");
                break;
            };
            self.ready.committed.push(CommittedEntry { index: next, entry });
            self.last_applied = Some(next);
        }
    }
}
