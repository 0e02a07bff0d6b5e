//! Shared scaffolding for the integration tests: a recording observer and
//! a couple of polling helpers for the "within N seconds" style assertions
//! the spec's scenarios are phrased with.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raftsim::{Cluster, ClusterEvent, NodeEvent, Role};

/// A thread-safe append-only log of every event published on a cluster's
/// observer bus, in the exact order they were produced.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ClusterEvent>>>,
}

impl EventLog {
    pub fn attach(cluster: &Cluster) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        cluster.register_observer(move |event: &ClusterEvent| {
            events.lock().push(event.clone());
        });
        log
    }

    pub fn snapshot(&self) -> Vec<ClusterEvent> {
        self.events.lock().clone()
    }

    /// Every `state_change` event, in order, as `(node_id, role, term)`.
    pub fn state_changes(&self) -> Vec<(usize, Role, u64)> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                ClusterEvent::Node(NodeEvent::StateChange { node_id, role, term }) => {
                    Some((node_id, role, term))
                }
                _ => None,
            })
            .collect()
    }

    /// Every `VoteResponse { vote_granted: true }` addressed to `target`
    /// at `term`, counted via the `message_sent` events nodes publish when
    /// replying (these always flow through the transport, per the
    /// resolved open question in DESIGN.md).
    pub fn votes_granted_for(&self, target: usize, term: u64) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|event| match event {
                ClusterEvent::Node(NodeEvent::MessageSent(envelope)) => {
                    matches!(
                        envelope.kind,
                        raftsim::MessageKind::VoteResponse { vote_granted: true }
                    ) && envelope.to == target
                        && envelope.term == term
                }
                _ => false,
            })
            .count()
    }
}

/// Polls `cluster` until `predicate` holds over its node snapshots, or
/// panics once `timeout` has elapsed.
pub async fn wait_until(
    cluster: &Cluster,
    timeout: Duration,
    mut predicate: impl FnMut(&[raftsim::NodeSnapshot]) -> bool,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshots = cluster.node_snapshots();
        if predicate(&snapshots) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}; last snapshots: {snapshots:?}");
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

pub fn leader_id(snapshots: &[raftsim::NodeSnapshot]) -> Option<usize> {
    snapshots.iter().position(|s| s.running && s.role == Role::Leader)
}
