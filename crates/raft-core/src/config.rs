//! # config
//!
//! why: timer ranges and cluster membership are fixed at construction time
//! relations: consumed by node.rs, loaded from json by raft-runtime callers
//! what: RaftConfig with defaults and validation, membership checks

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::NodeId;

/// Timer configuration for a single node, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: u64,
    /// Upper bound (inclusive) of the randomized election timeout.
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats.
    pub heartbeat_interval: u64,
    /// Seed for the election timeout generator. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    /// Parse a config from json. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 {
            return Err(RaftError::InvalidConfig(
                "election_timeout_min must be greater than zero".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be non-zero and below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// Check that `members` contains `id` exactly once and has no duplicates.
pub(crate) fn validate_membership(id: NodeId, members: &[NodeId]) -> Result<()> {
    let unique: BTreeSet<_> = members.iter().copied().collect();
    if unique.len() != members.len() {
        return Err(RaftError::InvalidConfig(format!(
            "duplicate ids in cluster membership {members:?}"
        )));
    }
    if !unique.contains(&id) {
        return Err(RaftError::UnknownMember(id));
    }
    Ok(())
}
