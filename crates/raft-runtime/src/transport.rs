//! # transport
//!
//! why: the node only hands envelopes to a transport, it never knows how they travel
//! relations: called by actor.rs, LocalNetwork routes into NodeHandle mailboxes
//! what: Transport trait, LocalNetwork in-process router with fault injection

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use raft_core::{Envelope, NodeId};
use tracing::{debug, trace};

use crate::actor::NodeHandle;

/// Fire-and-forget message delivery. Raft tolerates loss, duplication and
/// reordering, so implementations may drop messages instead of failing.
pub trait Transport: Send + 'static {
    fn send(&self, envelope: Envelope);

    /// Answer an inbound request. Same path as `send` unless the transport
    /// pairs replies with their requests.
    fn reply(&self, envelope: Envelope) {
        self.send(envelope)
    }
}

/// In-process network for running a cluster inside one tokio runtime.
///
/// Clones share the same routing table and fault settings.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Routes>>,
}

#[derive(Debug, Default)]
struct Routes {
    nodes: HashMap<NodeId, NodeHandle>,
    blocked: HashSet<(NodeId, NodeId)>,
    drop_rate: f64,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route messages addressed to `handle.id()` into its mailbox.
    pub fn register(&self, handle: NodeHandle) {
        self.routes().nodes.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: NodeId) {
        self.routes().nodes.remove(&id);
    }

    /// Drop all traffic between `id` and every other node.
    pub fn isolate(&self, id: NodeId) {
        let mut routes = self.routes();
        let others: Vec<NodeId> = routes.nodes.keys().copied().filter(|&n| n != id).collect();
        for other in others {
            routes.blocked.insert((id, other));
            routes.blocked.insert((other, id));
        }
    }

    /// Drop traffic from `from` to `to` only.
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.routes().blocked.insert((from, to));
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.routes().blocked.clear();
    }

    /// Drop each message independently with probability `rate`.
    pub fn set_drop_rate(&self, rate: f64) {
        self.routes().drop_rate = rate.clamp(0.0, 1.0);
    }
}

impl Transport for LocalNetwork {
    fn send(&self, envelope: Envelope) {
        let target = {
            let routes = self.routes();
            let term = envelope.message.term();
            if routes.blocked.contains(&(envelope.from, envelope.to)) {
                trace!(from = envelope.from, to = envelope.to, term, "partitioned, dropping message");
                return;
            }
            if routes.drop_rate > 0.0 && rand::thread_rng().gen_bool(routes.drop_rate) {
                trace!(from = envelope.from, to = envelope.to, term, "randomly dropping message");
                return;
            }
            routes.nodes.get(&envelope.to).cloned()
        };

        let (from, to) = (envelope.from, envelope.to);
        match target {
            Some(handle) => {
                if !handle.try_deliver(envelope) {
                    debug!(from, to, "mailbox full or closed, dropping message");
                }
            }
            None => debug!(from, to, "no route to node"),
        }
    }
}
