//! The fan-out event stream (component C4). Every state transition, message
//! send/delivery/drop, fault injection, and partition change is published
//! here, synchronously, on the thread that produced it — subscribers see
//! events in exactly the order they happened, with no reordering hop in
//! between.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::message::{Envelope, NodeId, Term};
use crate::node::Role;

/// Events a single node publishes about itself.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    StateChange { node_id: NodeId, role: Role, term: Term },
    MessageSent(Envelope),
    NodeFailure { node_id: NodeId },
    NodeRestore { node_id: NodeId },
}

/// Events the cluster as a whole publishes, including every forwarded
/// [`NodeEvent`] — mirroring the original's `node_event_callback`, which
/// re-published every per-node event under a single cluster-level
/// subscription alongside transport- and fault-level events.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    Node(NodeEvent),
    MessageDelivered(Envelope),
    MessageDropped(Envelope),
    NodeFailed { node_id: NodeId },
    NodeRestored { node_id: NodeId },
    NetworkPartition { groups: Vec<Vec<NodeId>> },
    NetworkHealed,
}

type Subscriber<E> = Box<dyn Fn(&E) + Send + Sync>;

/// A simple multi-subscriber, synchronous fan-out bus.
///
/// Registration is expected to happen before `start()`; after that the
/// subscriber list is read-only in practice, though it remains behind a
/// lock so a late registration is still well-defined rather than undefined
/// behavior.
pub struct ObserverBus<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
}

impl<E> Default for ObserverBus<E> {
    fn default() -> Self {
        Self { subscribers: RwLock::new(Vec::new()) }
    }
}

impl<E> ObserverBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Box::new(callback));
    }

    /// Invoke every subscriber with this event. A subscriber that panics is
    /// isolated via `catch_unwind` so it cannot take down delivery to the
    /// rest of the subscriber list, nor the node or pump that produced the
    /// event (the `ObserverFault` case in the error taxonomy).
    pub fn publish(&self, event: &E) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| subscriber(event)));
            if let Err(payload) = result {
                let message = panic_message(&payload);
                warn!(%message, "observer subscriber panicked; isolating and continuing");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A cluster-level bus that a node's own bus forwards into, matching the
/// original's behavior of having every node event flow through one
/// cluster-wide subscription point in addition to (not instead of)
/// per-node subscribers.
pub type NodeBus = Arc<ObserverBus<NodeEvent>>;
pub type ClusterBus = Arc<ObserverBus<ClusterEvent>>;
