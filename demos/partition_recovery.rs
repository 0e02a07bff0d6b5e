//! Demonstrates split-brain prevention: a minority partition never elects
//! a leader, and healing the partition reunifies the cluster under the
//! highest term anyone reached. Re-expresses the shape of the teacher's
//! `consensus_group_partition_recovery` example against the real `Cluster`
//! API.

use std::time::Duration;

use anyhow::Result;
use raftsim::{Cluster, Role};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cluster = Cluster::with_node_count(5)?;
    cluster.start();

    wait_for_any_leader(&cluster, Duration::from_secs(3)).await;
    println!("cluster elected a leader before partitioning\n");

    println!("=== partitioning into {{0,1}} (minority) and {{2,3,4}} (majority) ===");
    cluster.create_partition(vec![vec![0, 1], vec![2, 3, 4]]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    report(&cluster);

    println!("\n=== healing the partition ===");
    cluster.heal_partition();
    tokio::time::sleep(Duration::from_secs(2)).await;
    report(&cluster);

    cluster.stop().await;
    Ok(())
}

async fn wait_for_any_leader(cluster: &Cluster, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cluster.node_snapshots().iter().any(|s| s.role == Role::Leader) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader emerged within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn report(cluster: &Cluster) {
    for (id, snapshot) in cluster.node_snapshots().into_iter().enumerate() {
        println!("node {id}: {:?} term {}", snapshot.role, snapshot.term);
    }
}
