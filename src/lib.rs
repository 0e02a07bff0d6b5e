#![warn(clippy::all)]

//! A simulated cluster of nodes running a simplified Raft leader-election
//! protocol under a controllable network model.
//!
//! The three pieces that matter are [`node`] (the per-node election state
//! machine), [`transport`] (message routing, delay, and partitions), and
//! [`observer`] (the synchronous event fan-out everything else is built on
//! top of). [`Cluster`] wires them together into the one thing a caller
//! actually constructs.
//!
//! Log replication, persistence across restarts, snapshotting,
//! configuration changes, and client command submission are out of scope
//! — only the election subset of Raft is modeled.

pub mod error;
pub mod fault;
pub mod message;
pub mod node;
pub mod observer;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use error::{Error, Result};
pub use fault::FaultInjector;
pub use message::{Envelope, MessageKind, NodeId, Term};
pub use node::{ElectionConfig, NodeSnapshot, Role};
pub use observer::{ClusterEvent, NodeEvent};
pub use transport::{PartitionConfig, TransportConfig};

use observer::ObserverBus;
use transport::ClusterTransport;

/// Construction parameters for a [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_count: usize,
    pub election: ElectionConfig,
    pub transport: TransportConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { node_count: 5, election: ElectionConfig::default(), transport: TransportConfig::default() }
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(Error::InvalidConfiguration("node_count must be >= 1".into()));
        }
        let (low, high) = self.election.election_timeout_range;
        if low > high {
            return Err(Error::InvalidConfiguration(
                "election_timeout_range lower bound exceeds upper bound".into(),
            ));
        }
        if low < self.election.heartbeat_interval.saturating_mul(2) {
            return Err(Error::InvalidConfiguration(
                "election_timeout_range must exceed twice the heartbeat interval, or followers \
                 will time out on heartbeat jitter alone"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// The assembled simulation: a [`ClusterTransport`] owning `node_count`
/// nodes, plus a [`FaultInjector`] facade over it. This is the only type
/// most callers need to construct directly.
pub struct Cluster {
    transport: Arc<ClusterTransport>,
    fault: FaultInjector,
}

impl Cluster {
    /// Builds a cluster per `config`. The only error path in this whole
    /// crate: everything past construction reports runtime anomalies on
    /// the observer bus instead of returning `Result`.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(ObserverBus::new());
        let transport = Arc::new(ClusterTransport::new(
            config.node_count,
            config.election,
            config.transport,
            bus,
        ));
        let fault = FaultInjector::new(Arc::clone(&transport));
        Ok(Self { transport, fault })
    }

    /// Convenience constructor for `node_count` nodes with otherwise
    /// default timing.
    pub fn with_node_count(node_count: usize) -> Result<Self> {
        Self::new(ClusterConfig { node_count, ..ClusterConfig::default() })
    }

    pub fn start(&self) {
        self.transport.start();
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    pub fn node_count(&self) -> usize {
        self.transport.node_count()
    }

    pub fn node_snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.transport.snapshot(id)
    }

    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        self.transport.snapshots()
    }

    pub fn fault_injector(&self) -> &FaultInjector {
        &self.fault
    }

    pub fn fail_node(&self, node_id: NodeId) {
        self.fault.fail_node(node_id);
    }

    pub fn restore_node(&self, node_id: NodeId) {
        self.fault.restore_node(node_id);
    }

    pub fn create_partition(&self, groups: Vec<Vec<NodeId>>) {
        self.fault.create_partition(groups);
    }

    pub fn heal_partition(&self) {
        self.fault.heal_partition();
    }

    /// Registers a subscriber on the cluster-level observer bus. Events
    /// are delivered synchronously on whatever task produced them; see
    /// [`observer::ObserverBus::publish`].
    pub fn register_observer<F>(&self, callback: F)
    where
        F: Fn(&ClusterEvent) + Send + Sync + 'static,
    {
        self.transport.bus().subscribe(callback);
    }
}

/// How long a caller should wait, in the absence of faults, before some
/// node is guaranteed to have become leader — ten times the upper bound of
/// the default election timeout range, per the liveness property.
pub fn default_liveness_bound() -> Duration {
    ElectionConfig::default().election_timeout_range.1 * 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_nodes_is_rejected() {
        let result = Cluster::new(ClusterConfig { node_count: 0, ..ClusterConfig::default() });
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn inverted_timeout_range_is_rejected() {
        let mut config = ClusterConfig::default();
        config.election.election_timeout_range = (Duration::from_millis(300), Duration::from_millis(150));
        assert!(matches!(Cluster::new(config), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn timeout_range_too_close_to_heartbeat_is_rejected() {
        let mut config = ClusterConfig::default();
        config.election.election_timeout_range = (Duration::from_millis(10), Duration::from_millis(20));
        assert!(matches!(Cluster::new(config), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn default_config_constructs_a_five_node_cluster() {
        let cluster = Cluster::new(ClusterConfig::default()).unwrap();
        assert_eq!(cluster.node_count(), 5);
        for snapshot in cluster.node_snapshots() {
            assert_eq!(snapshot.role, Role::Follower);
            assert_eq!(snapshot.term, 0);
        }
    }

    #[test]
    fn out_of_range_node_snapshot_is_none() {
        let cluster = Cluster::with_node_count(3).unwrap();
        assert!(cluster.node_snapshot(10).is_none());
    }
}
