use serde::{Deserialize, Serialize};

/// A node identifier. Cluster membership is fixed at construction to the
/// range `[0, node_count)`, so a plain index is the natural representation.
pub type NodeId = usize;

/// An election term. Monotonically non-decreasing per node.
pub type Term = u64;

/// The four RPC shapes of the simplified election subset of Raft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageKind {
    RequestVote,
    VoteResponse { vote_granted: bool },
    AppendEntries { entries: Vec<()> },
    AppendEntriesResponse { success: bool },
}

/// A single in-flight message between two nodes, stamped with the sender's
/// term at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
}

impl Envelope {
    pub fn new(kind: MessageKind, from: NodeId, to: NodeId, term: Term) -> Self {
        Self { kind, from, to, term }
    }

    /// A short tag for logging, independent of payload contents.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::RequestVote => "RequestVote",
            MessageKind::VoteResponse { .. } => "VoteResponse",
            MessageKind::AppendEntries { .. } => "AppendEntries",
            MessageKind::AppendEntriesResponse { .. } => "AppendEntriesResponse",
        }
    }
}
