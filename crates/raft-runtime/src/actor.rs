//! # actor
//!
//! why: run one raft node as a single tokio task so events are handled one at a time
//! relations: owns a raft-core RaftNode, a raft-storage Storage, a Transport and a StateMachine
//! what: spawn_node/start_node, NodeHandle, NodeStatus, the event loop

use raft_core::{
    Envelope, LogIndex, NodeId, RaftConfig, RaftNode, Role, Term, TimerCommand, TimerKind,
    TimerToken,
};
use raft_storage::Storage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::error::{Result, RuntimeError};
use crate::state_machine::StateMachine;
use crate::transport::Transport;

const MAILBOX_CAPACITY: usize = 1024;

/// Point-in-time view of a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    pub log_len: u64,
}

impl NodeStatus {
    fn of(node: &RaftNode) -> Self {
        Self {
            id: node.id(),
            role: node.role(),
            term: node.current_term(),
            voted_for: node.voted_for(),
            leader_id: node.leader_id(),
            commit_index: node.commit_index(),
            last_applied: node.last_applied(),
            log_len: node.log().len(),
        }
    }
}

/// Events fed to the actor's mailbox.
#[derive(Debug)]
pub(crate) enum Command {
    Deliver(Envelope),
    Propose {
        command: Vec<u8>,
        respond_to: oneshot::Sender<Result<LogIndex>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Campaign,
    Shutdown,
}

/// Cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit a command. Resolves with its log index once it is appended
    /// and durable on this node, not once it commits.
    pub async fn propose(&self, command: impl Into<Vec<u8>>) -> Result<LogIndex> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::Propose {
            command: command.into(),
            respond_to,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::NodeStopped)?
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::Status { respond_to }).await?;
        rx.await.map_err(|_| RuntimeError::NodeStopped)
    }

    /// Hand an inbound message to the node.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.send(Command::Deliver(envelope)).await
    }

    /// Non-blocking delivery for transports. Returns false if the message
    /// was dropped because the mailbox is full or closed.
    pub fn try_deliver(&self, envelope: Envelope) -> bool {
        self.tx.try_send(Command::Deliver(envelope)).is_ok()
    }

    /// Start an election now instead of waiting for the timer.
    pub async fn campaign(&self) -> Result<()> {
        self.send(Command::Campaign).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RuntimeError::NodeStopped)
    }

    #[cfg(test)]
    pub(crate) fn detached(id: NodeId, capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { id, tx }, rx)
    }
}

/// Move `node` into its own task. The task ends on `shutdown`, when every
/// handle is dropped, or when storage fails.
pub fn spawn_node<S, T, M>(
    node: RaftNode,
    storage: S,
    transport: T,
    state_machine: M,
) -> (NodeHandle, JoinHandle<Result<()>>)
where
    S: Storage + Send + 'static,
    T: Transport,
    M: StateMachine,
{
    let (tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = NodeHandle { id: node.id(), tx };
    let actor = NodeActor {
        node,
        storage,
        transport,
        state_machine,
        mailbox,
        election: None,
        heartbeat: None,
    };
    (handle, tokio::spawn(actor.run()))
}

/// Recover durable state from `storage` and spawn the node.
pub fn start_node<S, T, M>(
    id: NodeId,
    members: Vec<NodeId>,
    config: RaftConfig,
    storage: S,
    transport: T,
    state_machine: M,
) -> Result<(NodeHandle, JoinHandle<Result<()>>)>
where
    S: Storage + Send + 'static,
    T: Transport,
    M: StateMachine,
{
    let (hard_state, log) = storage.recover()?;
    info!(
        node_id = id,
        term = hard_state.term,
        log_len = log.len(),
        "recovered persisted state"
    );
    let node = RaftNode::restore(id, members, config, hard_state, log)?;
    Ok(spawn_node(node, storage, transport, state_machine))
}

struct NodeActor<S, T, M> {
    node: RaftNode,
    storage: S,
    transport: T,
    state_machine: M,
    mailbox: mpsc::Receiver<Command>,
    election: Option<(TimerToken, Instant)>,
    heartbeat: Option<(TimerToken, Instant)>,
}

impl<S, T, M> NodeActor<S, T, M>
where
    S: Storage + Send + 'static,
    T: Transport,
    M: StateMachine,
{
    async fn run(mut self) -> Result<()> {
        let node_id = self.node.id();
        info!(node_id, members = ?self.node.members(), "node actor started");

        if let Err(e) = self.event_loop().await {
            error!(node_id, error = %e, "node actor failed");
            return Err(e);
        }
        info!(node_id, "node actor stopped");
        Ok(())
    }

    async fn event_loop(&mut self) -> Result<()> {
        self.process_ready()?;
        loop {
            let election_at = self.election.map(|(_, at)| at);
            let heartbeat_at = self.heartbeat.map(|(_, at)| at);

            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(Command::Shutdown) | None => return Ok(()),
                    Some(command) => self.handle(command)?,
                },
                _ = sleep_until(election_at) => {
                    if let Some((token, _)) = self.election.take() {
                        self.node.on_election_timeout(token);
                        self.process_ready()?;
                    }
                }
                _ = sleep_until(heartbeat_at) => {
                    if let Some((token, _)) = self.heartbeat.take() {
                        self.node.on_heartbeat_tick(token);
                        self.process_ready()?;
                    }
                }
            }
        }
    }

    fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Deliver(envelope) => {
                self.node.step(envelope);
                self.process_ready()
            }
            Command::Propose {
                command,
                respond_to,
            } => {
                let result = self.node.append_log_entry(command);
                // the entry must be durable before the caller hears about it
                self.process_ready()?;
                let _ = respond_to.send(result.map_err(RuntimeError::from));
                Ok(())
            }
            Command::Status { respond_to } => {
                let _ = respond_to.send(NodeStatus::of(&self.node));
                Ok(())
            }
            Command::Campaign => {
                self.node.start_election();
                self.process_ready()
            }
            Command::Shutdown => Ok(()),
        }
    }

    /// Drain the node's output: persist, then send, then schedule timers,
    /// then apply.
    fn process_ready(&mut self) -> Result<()> {
        while self.node.has_ready() {
            let ready = self.node.take_ready();
            // only the last instruction per timer kind matters
            let timers: Vec<TimerCommand> = ready.latest_timers().copied().collect();

            self.storage
                .persist(ready.hard_state.as_ref(), ready.log_delta.as_ref())?;

            for envelope in ready.messages {
                if envelope.message.is_response() {
                    self.transport.reply(envelope);
                } else {
                    self.transport.send(envelope);
                }
            }

            for command in timers {
                self.schedule(command);
            }

            for entry in &ready.committed {
                debug!(node_id = self.node.id(), index = entry.index, "applying entry");
                self.state_machine.apply(entry);
            }
        }
        Ok(())
    }

    fn schedule(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Arm { kind, token, after } => {
                let armed = Some((token, Instant::now() + after));
                match kind {
                    TimerKind::Election => self.election = armed,
                    TimerKind::Heartbeat => self.heartbeat = armed,
                }
            }
            TimerCommand::Cancel { kind } => match kind {
                TimerKind::Election => self.election = None,
                TimerKind::Heartbeat => self.heartbeat = None,
            },
        }
    }
}

/// Sleep until `deadline`, or forever when no timer is armed.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
