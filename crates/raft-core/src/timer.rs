//! # timer
//!
//! why: decide when election and heartbeat timers are armed or cancelled
//! relations: driven by node.rs, scheduled by whoever drains `Ready::timers`
//! what: TimerToken fencing, TimerCommand, randomized election timeouts

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Identifies one arming of a timer. A fire carrying an older token is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    Election,
    Heartbeat,
}

/// Instruction for the timer scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// (Re)arm `kind` to fire once after `after`, replacing any pending fire.
    Arm {
        kind: TimerKind,
        token: TimerToken,
        after: Duration,
    },
    Cancel { kind: TimerKind },
}

/// Per-node timer bookkeeping: the currently armed token for each timer.
#[derive(Debug)]
pub(crate) struct Timers {
    rng: StdRng,
    election_min_ms: u64,
    election_max_ms: u64,
    heartbeat: Duration,
    next_token: u64,
    pub(crate) election: Option<TimerToken>,
    pub(crate) heartbeat_token: Option<TimerToken>,
}

impl Timers {
    pub(crate) fn new(min_ms: u64, max_ms: u64, heartbeat: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            election_min_ms: min_ms,
            election_max_ms: max_ms,
            heartbeat,
            next_token: 0,
            election: None,
            heartbeat_token: None,
        }
    }

    fn fresh_token(&mut self) -> TimerToken {
        self.next_token += 1;
        TimerToken(self.next_token)
    }

    /// Arm the election timer with a fresh random timeout.
    pub(crate) fn arm_election(&mut self) -> TimerCommand {
        let token = self.fresh_token();
        self.election = Some(token);
        TimerCommand::Arm {
            kind: TimerKind::Election,
            token,
            after: random_election_timeout(
                &mut self.rng,
                self.election_min_ms,
                self.election_max_ms,
            ),
        }
    }

    pub(crate) fn arm_heartbeat(&mut self) -> TimerCommand {
        let token = self.fresh_token();
        self.heartbeat_token = Some(token);
        TimerCommand::Arm {
            kind: TimerKind::Heartbeat,
            token,
            after: self.heartbeat,
        }
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) -> Option<TimerCommand> {
        let slot = match kind {
            TimerKind::Election => &mut self.election,
            TimerKind::Heartbeat => &mut self.heartbeat_token,
        };
        slot.take().map(|_| TimerCommand::Cancel { kind })
    }

    pub(crate) fn is_current(&self, kind: TimerKind, token: TimerToken) -> bool {
        let slot = match kind {
            TimerKind::Election => self.election,
            TimerKind::Heartbeat => self.heartbeat_token,
        };
        slot == Some(token)
    }
}

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(rng: &mut impl Rng, min_ms: u64, max_ms: u64) -> Duration {
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}
