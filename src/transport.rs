//! The cluster transport (component C2): owns every node, buffers outbound
//! messages, applies per-hop delay, and enforces the partition filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::message::{Envelope, NodeId};
use crate::node::{ElectionConfig, Node, NodeSnapshot};
use crate::observer::{ClusterBus, ClusterEvent, NodeEvent};

/// How long the transport waits, after a cooperative `stop()`, for its
/// pump and node tick tasks to notice the flag and exit before abandoning
/// whatever is left running.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Timing knobs for the transport itself, distinct from a node's election
/// timing (`ElectionConfig`).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Simulated per-message network latency, applied once per envelope.
    pub message_delay: Duration,
    /// How often the pump wakes up to drain the pending buffer.
    pub pump_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { message_delay: Duration::from_millis(10), pump_interval: Duration::from_millis(10) }
    }
}

/// The partition filter's configuration: a flag plus the groups that are
/// mutually reachable while it is set. Groups need not partition `[0, N)`
/// — a node absent from every group becomes fully isolated — and need not
/// be disjoint from one another.
#[derive(Debug, Clone, Default)]
pub struct PartitionConfig {
    pub partitioned: bool,
    pub groups: Vec<Vec<NodeId>>,
}

struct Handles {
    nodes: Vec<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

/// Owns the cluster's nodes and routes every message between them.
pub struct ClusterTransport {
    nodes: Vec<Arc<Node>>,
    pending: Arc<Mutex<Vec<Envelope>>>,
    partition: Arc<RwLock<PartitionConfig>>,
    config: TransportConfig,
    pump_running: Arc<AtomicBool>,
    bus: ClusterBus,
    handles: Mutex<Handles>,
}

impl ClusterTransport {
    pub fn new(
        node_count: usize,
        election_config: ElectionConfig,
        transport_config: TransportConfig,
        bus: ClusterBus,
    ) -> Self {
        let pending: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let mut nodes = Vec::with_capacity(node_count);
        for id in 0..node_count {
            let node_bus = Arc::new(crate::observer::ObserverBus::new());
            let node = Arc::new(Node::new(id, node_count, election_config.clone(), node_bus.clone()));

            // The transport subscribes to message_sent events to pick up
            // outbound traffic, and forwards every node event onto the
            // cluster-level bus so a single subscription sees the whole run.
            let pending_for_sub = Arc::clone(&pending);
            let cluster_bus_for_sub = Arc::clone(&bus);
            node_bus.subscribe(move |event: &NodeEvent| {
                if let NodeEvent::MessageSent(envelope) = event {
                    pending_for_sub.lock().push(envelope.clone());
                }
                cluster_bus_for_sub.publish(&ClusterEvent::Node(event.clone()));
            });

            nodes.push(node);
        }

        Self {
            nodes,
            pending,
            partition: Arc::new(RwLock::new(PartitionConfig::default())),
            config: transport_config,
            pump_running: Arc::new(AtomicBool::new(false)),
            bus,
            handles: Mutex::new(Handles { nodes: Vec::new(), pump: None }),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.nodes.get(id).map(|n| n.snapshot())
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }

    pub fn bus(&self) -> &ClusterBus {
        &self.bus
    }

    /// Starts every node's tick loop and the transport's own pump loop.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        handles.nodes = self.nodes.iter().map(|n| n.start()).collect();

        self.pump_running.store(true, Ordering::SeqCst);
        let pending = Arc::clone(&self.pending);
        let partition = Arc::clone(&self.partition);
        let nodes = self.nodes.clone();
        let bus = Arc::clone(&self.bus);
        let pump_running = Arc::clone(&self.pump_running);
        let config = self.config.clone();

        handles.pump = Some(tokio::spawn(async move {
            pump_loop(pending, partition, nodes, bus, pump_running, config).await;
        }));
    }

    /// Cooperatively stops the pump and every node, waiting a grace period
    /// for the tasks to drain before abandoning whatever's left.
    pub async fn stop(&self) {
        self.pump_running.store(false, Ordering::SeqCst);
        for node in &self.nodes {
            node.stop();
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let mut handles = self.handles.lock();
        if let Some(pump) = handles.pump.take() {
            pump.abort();
        }
        for handle in handles.nodes.drain(..) {
            handle.abort();
        }
    }

    pub fn create_partition(&self, groups: Vec<Vec<NodeId>>) {
        *self.partition.write() = PartitionConfig { partitioned: true, groups: groups.clone() };
        debug!(?groups, "partition installed");
        self.bus.publish(&ClusterEvent::NetworkPartition { groups });
    }

    pub fn heal_partition(&self) {
        *self.partition.write() = PartitionConfig::default();
        debug!("partition healed");
        self.bus.publish(&ClusterEvent::NetworkHealed);
    }

    pub fn fail_node(&self, node_id: NodeId) {
        let Some(node) = self.nodes.get(node_id) else { return };
        node.simulate_failure();
        self.bus.publish(&ClusterEvent::NodeFailed { node_id });
    }

    pub fn restore_node(&self, node_id: NodeId) {
        let Some(node) = self.nodes.get(node_id) else { return };
        // `restore()` spawns a fresh tick-loop task (the one from `start()`
        // exited for good when the node stopped running); fold its handle
        // into the same set `stop()` aborts after the shutdown grace period,
        // or it would tick forever past a cluster-wide stop.
        if let Some(handle) = node.restore() {
            self.handles.lock().nodes.push(handle);
        }
        self.bus.publish(&ClusterEvent::NodeRestored { node_id });
    }
}

/// The partition filter: true iff both endpoints appear together in some
/// group, or the cluster is not currently partitioned at all.
fn can_deliver(partition: &PartitionConfig, from: NodeId, to: NodeId) -> bool {
    if !partition.partitioned {
        return true;
    }
    partition.groups.iter().any(|group| group.contains(&from) && group.contains(&to))
}

async fn pump_loop(
    pending: Arc<Mutex<Vec<Envelope>>>,
    partition: Arc<RwLock<PartitionConfig>>,
    nodes: Vec<Arc<Node>>,
    bus: ClusterBus,
    pump_running: Arc<AtomicBool>,
    config: TransportConfig,
) {
    while pump_running.load(Ordering::SeqCst) {
        // Atomically swap the pending buffer for an empty one so producers
        // appending after this point land in the new buffer, never the
        // drained one.
        let batch = std::mem::take(&mut *pending.lock());

        for envelope in batch {
            tokio::time::sleep(config.message_delay).await;

            let deliverable = can_deliver(&partition.read(), envelope.from, envelope.to);
            let destination_alive =
                nodes.get(envelope.to).map(|n| n.is_running()).unwrap_or(false);

            if deliverable && destination_alive {
                if let Some(node) = nodes.get(envelope.to) {
                    node.receive_message(envelope.clone());
                }
                trace!(from = envelope.from, to = envelope.to, kind = envelope.kind_name(), "delivered");
                bus.publish(&ClusterEvent::MessageDelivered(envelope));
            } else {
                trace!(from = envelope.from, to = envelope.to, kind = envelope.kind_name(), "dropped");
                bus.publish(&ClusterEvent::MessageDropped(envelope));
            }
        }

        tokio::time::sleep(config.pump_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpartitioned_cluster_delivers_everywhere() {
        let partition = PartitionConfig::default();
        assert!(can_deliver(&partition, 0, 4));
    }

    #[test]
    fn partitioned_cluster_only_delivers_within_a_group() {
        let partition =
            PartitionConfig { partitioned: true, groups: vec![vec![0, 1], vec![2, 3, 4]] };
        assert!(can_deliver(&partition, 0, 1));
        assert!(can_deliver(&partition, 2, 4));
        assert!(!can_deliver(&partition, 0, 2));
    }

    #[test]
    fn node_omitted_from_every_group_is_fully_isolated() {
        let partition = PartitionConfig { partitioned: true, groups: vec![vec![0, 1]] };
        assert!(!can_deliver(&partition, 2, 0));
        assert!(!can_deliver(&partition, 2, 3));
    }

    #[test]
    fn overlapping_groups_widen_reachability_as_specified() {
        let partition =
            PartitionConfig { partitioned: true, groups: vec![vec![0, 1], vec![1, 2]] };
        assert!(can_deliver(&partition, 0, 1));
        assert!(can_deliver(&partition, 1, 2));
        assert!(!can_deliver(&partition, 0, 2), "0 and 2 never share a single group");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fault_injector_ignores_out_of_range_node_ids() {
        let bus = Arc::new(crate::observer::ObserverBus::new());
        let transport = ClusterTransport::new(
            3,
            ElectionConfig::default(),
            TransportConfig::default(),
            bus,
        );
        // Must not panic.
        transport.fail_node(99);
        transport.restore_node(99);
    }
}
