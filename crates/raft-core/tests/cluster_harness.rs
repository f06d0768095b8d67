//! Deterministic in-memory cluster for raft-core integration tests.
//!
//! Nodes talk through a simulated network driven by virtual time. Loss,
//! duplication, delay (and so reordering) come from a seeded rng, so a
//! given seed always replays the same schedule. Safety invariants are
//! asserted after every event.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raft_core::{
    CommittedEntry, Envelope, LogEntry, LogIndex, NodeId, RaftConfig, RaftMessage, RaftNode,
    Term, TimerCommand, TimerKind, TimerToken,
};

/// Test config: default timeouts, per-node deterministic randomness.
pub fn test_config(seed: u64, id: NodeId) -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 50,
        rng_seed: Some(seed.wrapping_mul(1_000).wrapping_add(id)),
    }
}

struct InFlight {
    at: u64,
    seq: u64,
    envelope: Envelope,
}

struct ScheduledTimer {
    node: NodeId,
    kind: TimerKind,
    token: TimerToken,
    at: u64,
}

enum Event {
    Deliver(usize),
    Fire(usize),
}

pub struct Cluster {
    nodes: BTreeMap<NodeId, RaftNode>,
    rng: StdRng,
    now: u64,
    seq: u64,
    in_flight: Vec<InFlight>,
    timers: Vec<ScheduledTimer>,
    blocked: BTreeSet<(NodeId, NodeId)>,

    /// Probability that a sent message is dropped.
    pub loss: f64,
    /// Probability that a sent message is delivered twice.
    pub duplicate: f64,
    /// Extra random delay in ms on top of the 1ms base latency.
    pub max_delay: u64,

    applied: BTreeMap<NodeId, Vec<CommittedEntry>>,
    /// Every entry any node applied, with the lowest term it was seen in.
    committed: BTreeMap<LogIndex, (LogEntry, Term)>,
    leaders: BTreeMap<Term, NodeId>,
    commit_seen: BTreeMap<NodeId, Option<LogIndex>>,
    rejected_appends: usize,
}

impl Cluster {
    /// A cluster of nodes `1..=size` on a perfect network.
    pub fn new(size: u64, seed: u64) -> Self {
        let members: Vec<NodeId> = (1..=size).collect();
        let nodes = members
            .iter()
            .map(|&id| {
                let node = RaftNode::with_config(id, members.clone(), test_config(seed, id))
                    .expect("valid test config");
                (id, node)
            })
            .collect();
        let mut cluster = Self {
            nodes,
            rng: StdRng::seed_from_u64(seed),
            now: 0,
            seq: 0,
            in_flight: Vec::new(),
            timers: Vec::new(),
            blocked: BTreeSet::new(),
            loss: 0.0,
            duplicate: 0.0,
            max_delay: 0,
            applied: BTreeMap::new(),
            committed: BTreeMap::new(),
            leaders: BTreeMap::new(),
            commit_seen: BTreeMap::new(),
            rejected_appends: 0,
        };
        for id in members {
            cluster.collect(id);
        }
        cluster
    }

    // -- inspection --

    pub fn node(&self, id: NodeId) -> &RaftNode {
        &self.nodes[&id]
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// The leader of the highest term, if any node believes it leads.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.current_term())
            .map(|n| n.id())
    }

    pub fn applied(&self, id: NodeId) -> &[CommittedEntry] {
        self.applied.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn applied_commands(&self, id: NodeId) -> Vec<Vec<u8>> {
        self.applied(id)
            .iter()
            .map(|c| c.entry.command.clone())
            .collect()
    }

    /// Failed AppendEntries responses delivered so far.
    pub fn rejected_appends(&self) -> usize {
        self.rejected_appends
    }

    // -- driving --

    pub fn propose_at(&mut self, id: NodeId, command: &[u8]) -> raft_core::Result<LogIndex> {
        let result = self.node_mut(id).append_log_entry(command.to_vec());
        self.collect(id);
        result
    }

    pub fn propose(&mut self, command: &[u8]) -> Option<LogIndex> {
        let leader = self.leader()?;
        self.propose_at(leader, command).ok()
    }

    /// Fire `id`'s election timer now, as if it expired.
    pub fn fire_election_timeout(&mut self, id: NodeId) {
        let token = self
            .node(id)
            .election_timer()
            .expect("node has no election timer armed");
        self.timers
            .retain(|t| !(t.node == id && t.kind == TimerKind::Election));
        self.node_mut(id).on_election_timeout(token);
        self.collect(id);
    }

    pub fn fire_heartbeat(&mut self, id: NodeId) {
        let token = self
            .node(id)
            .heartbeat_timer()
            .expect("node has no heartbeat timer armed");
        self.timers
            .retain(|t| !(t.node == id && t.kind == TimerKind::Heartbeat));
        self.node_mut(id).on_heartbeat_tick(token);
        self.collect(id);
    }

    /// Deliver in-flight messages until the network is quiet. Timers do not fire.
    pub fn deliver_all(&mut self) {
        for _ in 0..100_000 {
            let Some(i) = self.next_message() else {
                return;
            };
            let message = self.in_flight.remove(i);
            self.now = self.now.max(message.at);
            self.deliver(message.envelope);
        }
        panic!("network did not go quiet");
    }

    /// Process the next message or timer. Returns false when nothing is pending.
    pub fn step(&mut self) -> bool {
        let Some((at, event)) = self.next_event() else {
            return false;
        };
        self.now = self.now.max(at);
        match event {
            Event::Deliver(i) => {
                let message = self.in_flight.remove(i);
                self.deliver(message.envelope);
            }
            Event::Fire(i) => {
                let timer = self.timers.remove(i);
                self.fire(timer);
            }
        }
        true
    }

    /// Advance virtual time by `ms`, processing everything due.
    pub fn run_for(&mut self, ms: u64) {
        let end = self.now + ms;
        while let Some((at, _)) = self.next_event() {
            if at > end {
                break;
            }
            self.step();
        }
        self.now = end;
    }

    /// Run until `done` holds, checking every 10ms of virtual time.
    pub fn run_until(&mut self, max_ms: u64, done: impl Fn(&Cluster) -> bool) -> bool {
        let deadline = self.now + max_ms;
        while self.now < deadline {
            if done(self) {
                return true;
            }
            self.run_for(10);
        }
        done(self)
    }

    // -- faults --

    /// Cut `id` off from every other node in both directions.
    pub fn isolate(&mut self, id: NodeId) {
        for other in self.ids() {
            if other != id {
                self.blocked.insert((id, other));
                self.blocked.insert((other, id));
            }
        }
    }

    /// Only nodes within the same group can talk.
    pub fn partition(&mut self, groups: &[&[NodeId]]) {
        for (i, a) in groups.iter().enumerate() {
            for b in &groups[i + 1..] {
                for &x in a.iter() {
                    for &y in b.iter() {
                        self.blocked.insert((x, y));
                        self.blocked.insert((y, x));
                    }
                }
            }
        }
    }

    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    // -- invariants --

    /// Two logs holding the same term at an index are identical up to it.
    pub fn assert_log_matching(&self) {
        let nodes: Vec<&RaftNode> = self.nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let shared = a.log().len().min(b.log().len());
                let last_agreeing =
                    (0..shared).rev().find(|&idx| a.log().term_at(idx) == b.log().term_at(idx));
                if let Some(last) = last_agreeing {
                    assert_eq!(
                        a.log().slice(0, last),
                        b.log().slice(0, last),
                        "logs of {} and {} diverge before index {last}",
                        a.id(),
                        b.id()
                    );
                }
            }
        }
    }

    pub fn assert_logs_identical(&self) {
        let mut logs = self.nodes.values().map(|n| (n.id(), n.log().entries()));
        let Some((first_id, first)) = logs.next() else {
            return;
        };
        for (id, log) in logs {
            assert_eq!(first, log, "logs of {first_id} and {id} differ");
        }
    }

    // -- internals --

    fn node_mut(&mut self, id: NodeId) -> &mut RaftNode {
        self.nodes.get_mut(&id).expect("unknown node")
    }

    fn next_message(&self) -> Option<usize> {
        self.in_flight
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| (m.at, m.seq))
            .map(|(i, _)| i)
    }

    fn next_event(&self) -> Option<(u64, Event)> {
        let message = self.next_message().map(|i| (self.in_flight[i].at, i));
        let timer = self
            .timers
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.at)
            .map(|(i, t)| (t.at, i));
        match (message, timer) {
            (Some((m_at, m)), Some((t_at, _))) if m_at <= t_at => Some((m_at, Event::Deliver(m))),
            (_, Some((t_at, t))) => Some((t_at, Event::Fire(t))),
            (Some((m_at, m)), None) => Some((m_at, Event::Deliver(m))),
            (None, None) => None,
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        if self.blocked.contains(&(envelope.from, envelope.to)) {
            return;
        }
        if let RaftMessage::AppendEntriesResponse(resp) = &envelope.message {
            if !resp.success {
                self.rejected_appends += 1;
            }
        }
        let to = envelope.to;
        self.node_mut(to).step(envelope);
        self.collect(to);
    }

    fn fire(&mut self, timer: ScheduledTimer) {
        let node = self.node_mut(timer.node);
        match timer.kind {
            TimerKind::Election => node.on_election_timeout(timer.token),
            TimerKind::Heartbeat => node.on_heartbeat_tick(timer.token),
        }
        self.collect(timer.node);
    }

    fn send(&mut self, envelope: Envelope) {
        if self.blocked.contains(&(envelope.from, envelope.to)) || self.rng.gen_bool(self.loss) {
            return;
        }
        let copies = if self.rng.gen_bool(self.duplicate) { 2 } else { 1 };
        for _ in 0..copies {
            let delay = 1 + self.rng.gen_range(0..=self.max_delay);
            self.seq += 1;
            self.in_flight.push(InFlight {
                at: self.now + delay,
                seq: self.seq,
                envelope: envelope.clone(),
            });
        }
    }

    fn schedule(&mut self, node: NodeId, command: TimerCommand) {
        match command {
            TimerCommand::Arm { kind, token, after } => {
                self.timers.retain(|t| !(t.node == node && t.kind == kind));
                self.timers.push(ScheduledTimer {
                    node,
                    kind,
                    token,
                    at: self.now + after.as_millis() as u64,
                });
            }
            TimerCommand::Cancel { kind } => {
                self.timers.retain(|t| !(t.node == node && t.kind == kind));
            }
        }
    }

    /// Drain a node's outbox into the network, the timer wheel and the
    /// applied record, then check the safety invariants it can affect.
    fn collect(&mut self, id: NodeId) {
        let ready = self.node_mut(id).take_ready();
        let timers: Vec<TimerCommand> = ready.latest_timers().copied().collect();
        for command in timers {
            self.schedule(id, command);
        }
        for envelope in ready.messages {
            self.send(envelope);
        }
        for committed in ready.committed {
            self.record_apply(id, committed);
        }
        self.check_node(id);
    }

    fn record_apply(&mut self, id: NodeId, committed: CommittedEntry) {
        let term = self.nodes[&id].current_term();
        let applied = self.applied.entry(id).or_default();
        assert_eq!(
            committed.index,
            applied.len() as u64,
            "node {id} applied out of order"
        );
        match self.committed.get_mut(&committed.index) {
            Some((entry, seen)) => {
                assert_eq!(
                    *entry, committed.entry,
                    "node {id} applied a different entry at index {}",
                    committed.index
                );
                *seen = (*seen).min(term);
            }
            None => {
                self.committed
                    .insert(committed.index, (committed.entry.clone(), term));
            }
        }
        applied.push(committed);
    }

    fn check_node(&mut self, id: NodeId) {
        let node = &self.nodes[&id];
        let commit = node.commit_index();
        let previous = self.commit_seen.insert(id, commit).flatten();
        assert!(commit >= previous, "node {id} commit index went backwards");
        assert!(node.last_applied() <= commit);

        if !node.is_leader() {
            return;
        }
        let term = node.current_term();
        match self.leaders.get(&term) {
            Some(&other) => assert_eq!(other, id, "two leaders elected in term {term}"),
            None => {
                for (index, (entry, seen)) in &self.committed {
                    if *seen < term {
                        assert_eq!(
                            node.log().get(*index),
                            Some(entry),
                            "leader {id} of term {term} is missing committed index {index}"
                        );
                    }
                }
                self.leaders.insert(term, id);
            }
        }
    }
}
