//! # raft-demo
//!
//! why: watch a cluster elect, replicate and fail over from a terminal
//! relations: wires raft-runtime actors over LocalNetwork with raft-storage backends
//! what: starts N nodes, submits commands, isolates the leader, heals, prints status

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use raft_core::{CommittedEntry, NodeId, RaftConfig, Role};
use raft_runtime::{start_node, ApplyChannel, LocalNetwork, NodeHandle, NodeStatus};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "raft-demo")]
#[command(about = "Run an in-process raft cluster and fail over its leader")]
struct Args {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Commands to submit before and after failover
    #[arg(long, default_value = "5")]
    commands: usize,

    /// JSON file with election/heartbeat timing
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persist each node under <data-dir>/node-<id> instead of in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Probability of dropping any single message
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }

    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            RaftConfig::from_json(&json)?
        }
        None => RaftConfig::default(),
    };

    match args.data_dir.clone() {
        Some(dir) => {
            run(&args, config, |id| {
                Ok(FileStorage::new(dir.join(format!("node-{id}")))?)
            })
            .await
        }
        None => run(&args, config, |_| Ok(InMemoryStorage::new())).await,
    }
}

struct DemoNode {
    handle: NodeHandle,
    task: JoinHandle<raft_runtime::Result<()>>,
    applied: mpsc::UnboundedReceiver<CommittedEntry>,
}

async fn run<S, F>(args: &Args, config: RaftConfig, open: F) -> Result<()>
where
    S: Storage + Send + 'static,
    F: Fn(NodeId) -> Result<S>,
{
    let members: Vec<NodeId> = (1..=args.nodes).collect();
    let network = LocalNetwork::new();
    network.set_drop_rate(args.drop_rate);

    let mut nodes = Vec::new();
    for &id in &members {
        let (apply, applied) = ApplyChannel::new();
        let (handle, task) = start_node(
            id,
            members.clone(),
            config.clone(),
            open(id)?,
            network.clone(),
            apply,
        )?;
        network.register(handle.clone());
        nodes.push(DemoNode {
            handle,
            task,
            applied,
        });
    }

    let leader = wait_for_leader(&nodes, None).await?;
    info!(leader = leader.id, term = leader.term, "cluster has a leader");
    submit(&nodes, leader.id, "before", args.commands).await?;

    if nodes.len() > 2 {
        network.isolate(leader.id);
        info!(node_id = leader.id, "isolated leader");
        let next = wait_for_leader(&nodes, Some(leader.id)).await?;
        info!(leader = next.id, term = next.term, "failover complete");
        submit(&nodes, next.id, "after", args.commands).await?;
        network.heal();
        info!("partition healed");
        tokio::time::sleep(config.heartbeat() * 5).await;
    }

    for node in &mut nodes {
        let mut count = 0;
        while node.applied.try_recv().is_ok() {
            count += 1;
        }
        let status = node.handle.status().await?;
        print_status(&status, count);
    }

    for node in nodes {
        network.unregister(node.handle.id());
        node.handle.shutdown().await?;
        node.task.await??;
    }
    Ok(())
}

/// Poll until a leader outside `excluding` is known.
async fn wait_for_leader(nodes: &[DemoNode], excluding: Option<NodeId>) -> Result<NodeStatus> {
    for _ in 0..250 {
        let mut best: Option<NodeStatus> = None;
        for node in nodes {
            if Some(node.handle.id()) == excluding {
                continue;
            }
            let status = node.handle.status().await?;
            if status.role == Role::Leader && best.as_ref().map_or(true, |b| status.term > b.term) {
                best = Some(status);
            }
        }
        if let Some(leader) = best {
            return Ok(leader);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("no leader elected within 5s")
}

async fn submit(nodes: &[DemoNode], leader: NodeId, tag: &str, count: usize) -> Result<()> {
    let Some(node) = nodes.iter().find(|n| n.handle.id() == leader) else {
        bail!("unknown leader {leader}");
    };
    for i in 0..count {
        let command = format!("{tag}-{i}");
        match node.handle.propose(command.clone()).await {
            Ok(index) => info!(index, %command, "submitted"),
            Err(e) => warn!(%command, error = %e, "submit failed"),
        }
    }
    Ok(())
}

fn print_status(status: &NodeStatus, applied_now: usize) {
    println!(
        "node {} role={} term={} log_len={} commit={:?} applied={:?} (+{} this run)",
        status.id,
        status.role,
        status.term,
        status.log_len,
        status.commit_index,
        status.last_applied,
        applied_now,
    );
}
