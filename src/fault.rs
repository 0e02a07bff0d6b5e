//! The fault-injection surface (component C3): a thin facade over
//! [`ClusterTransport`] so call sites that drive a scenario ("fail node 2",
//! "partition the cluster") read as a distinct collaborator from routing,
//! matching the component table's split between C2 and C3.

use std::sync::Arc;

use crate::message::NodeId;
use crate::transport::ClusterTransport;

#[derive(Clone)]
pub struct FaultInjector {
    transport: Arc<ClusterTransport>,
}

impl FaultInjector {
    pub fn new(transport: Arc<ClusterTransport>) -> Self {
        Self { transport }
    }

    /// Out-of-range node ids are a silent no-op, not an error — see the
    /// error taxonomy's `UnknownNode` variant.
    pub fn fail_node(&self, node_id: NodeId) {
        self.transport.fail_node(node_id);
    }

    pub fn restore_node(&self, node_id: NodeId) {
        self.transport.restore_node(node_id);
    }

    /// Installs a partition. Groups need not cover every node, and need
    /// not be disjoint; reachability is defined purely by shared group
    /// membership.
    pub fn create_partition(&self, groups: Vec<Vec<NodeId>>) {
        self.transport.create_partition(groups);
    }

    /// Always safe to call, including when no partition is active.
    pub fn heal_partition(&self) {
        self.transport.heal_partition();
    }
}
