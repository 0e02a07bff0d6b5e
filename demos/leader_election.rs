//! Demonstrates a single leader emerging from a healthy five-node cluster,
//! then failing over once its leader is killed. Re-expresses the shape of
//! the teacher's `consensus_group_basics` example against the real
//! `Cluster` API instead of a standalone toy model.

use std::time::Duration;

use anyhow::Result;
use raftsim::{Cluster, ClusterEvent, NodeEvent, Role};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cluster = Cluster::with_node_count(5)?;

    cluster.register_observer(|event: &ClusterEvent| match event {
        ClusterEvent::Node(NodeEvent::StateChange { node_id, role, term }) => {
            println!("node {node_id}: state_change -> {role:?} (term {term})");
        }
        ClusterEvent::NodeFailed { node_id } => println!("node {node_id}: failed"),
        ClusterEvent::NodeRestored { node_id } => println!("node {node_id}: restored"),
        _ => {}
    });

    cluster.start();

    println!("=== waiting for a leader to emerge ===");
    let leader = wait_for_leader(&cluster, Duration::from_secs(3)).await;
    println!("leader is node {leader}\n");

    println!("=== failing the leader ===");
    cluster.fail_node(leader);

    let new_leader = wait_for_leader(&cluster, Duration::from_secs(3)).await;
    println!("new leader is node {new_leader}");

    cluster.stop().await;
    Ok(())
}

async fn wait_for_leader(cluster: &Cluster, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(id) = cluster
            .node_snapshots()
            .iter()
            .position(|s| s.running && s.role == Role::Leader)
        {
            return id;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader emerged within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
