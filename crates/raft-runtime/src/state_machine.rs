//! # state machine
//!
//! why: committed entries leave the consensus layer through one narrow seam
//! relations: called by actor.rs after each Ready is persisted and sent
//! what: StateMachine trait, closure impl, ApplyChannel

use raft_core::CommittedEntry;
use tokio::sync::mpsc;
use tracing::debug;

/// The application fed by a node. `apply` is called once per committed
/// entry, in index order.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &CommittedEntry);
}

impl<F> StateMachine for F
where
    F: FnMut(&CommittedEntry) + Send + 'static,
{
    fn apply(&mut self, entry: &CommittedEntry) {
        self(entry)
    }
}

/// Forwards committed entries to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ApplyChannel {
    tx: mpsc::UnboundedSender<CommittedEntry>,
}

impl ApplyChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommittedEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateMachine for ApplyChannel {
    fn apply(&mut self, entry: &CommittedEntry) {
        if self.tx.send(entry.clone()).is_err() {
            debug!(index = entry.index, "apply receiver dropped, discarding entry");
        }
    }
}
