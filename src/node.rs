//! The per-node consensus state machine (component C1): term progression,
//! vote requests, vote counting, leader heartbeats, and the
//! follower/candidate/leader transitions between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::message::{Envelope, MessageKind, NodeId, Term};
use crate::observer::{NodeBus, NodeEvent};

/// A node's role in the election protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A placeholder log entry. The log is required to exist as an ordered
/// sequence but this simulation only ever models the election subset of
/// Raft, so it is never appended to — see the crate's non-goals.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry;

/// Tunable timing knobs, all exposed so scenarios can dial them instead of
/// depending on hard-coded magic numbers.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub election_timeout_range: (Duration, Duration),
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_range: (Duration::from_millis(150), Duration::from_millis(300)),
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
        }
    }
}

impl ElectionConfig {
    fn draw_timeout(&self) -> Duration {
        let (low, high) = self.election_timeout_range;
        let low_ms = low.as_millis() as u64;
        let high_ms = high.as_millis() as u64;
        let millis = if low_ms >= high_ms {
            low_ms
        } else {
            rand::thread_rng().gen_range(low_ms..=high_ms)
        };
        Duration::from_millis(millis)
    }
}

/// The persistent-ish + volatile election state described in the data
/// model. Guarded by a single lock since every field transitions together
/// under the handlers below — there is no benefit to finer-grained locking
/// for state this small.
struct NodeState {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    votes_received: usize,
    last_heartbeat_time: Instant,
    last_heartbeat_broadcast: Instant,
    election_timeout: Duration,
}

impl NodeState {
    fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            votes_received: 0,
            last_heartbeat_time: now,
            last_heartbeat_broadcast: now,
            election_timeout: timeout,
        }
    }

    /// Adopts a higher term if `term` exceeds `current_term`, clearing the
    /// vote and stepping down to `Follower` *before* any subsequent
    /// decision is made with that term (invariant I2). Returns whether an
    /// adoption happened, so the caller can publish a single
    /// `state_change` event once the lock is released.
    fn adopt_term_if_newer(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.role = Role::Follower;
            true
        } else {
            false
        }
    }
}

/// A snapshot of a node's publicly observable state. Readers (tests, a
/// visualizer) must tolerate this being torn relative to the node's live
/// state — it is a point-in-time copy, not a guarantee.
#[derive(Debug, Clone, Copy)]
pub struct NodeSnapshot {
    pub role: Role,
    pub term: Term,
    pub running: bool,
}

/// A single cluster member running the election state machine.
pub struct Node {
    id: NodeId,
    node_count: usize,
    config: ElectionConfig,
    state: RwLock<NodeState>,
    running: AtomicBool,
    bus: NodeBus,
}

impl Node {
    pub fn new(id: NodeId, node_count: usize, config: ElectionConfig, bus: NodeBus) -> Self {
        let timeout = config.draw_timeout();
        Self {
            id,
            node_count,
            config,
            state: RwLock::new(NodeState::new(timeout)),
            running: AtomicBool::new(false),
            bus,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn bus(&self) -> &NodeBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot { role: state.role, term: state.current_term, running: self.is_running() }
    }

    /// Begins the node's periodic tick as a background task. Returns the
    /// join handle so the owning transport can wait out the shutdown grace
    /// period and then abort anything still running.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        self.spawn_tick_loop()
    }

    /// Spawns the tick-loop task itself, without touching `running`. Shared
    /// by `start()` and `restore()`, since a restored node needs a fresh
    /// task — the one spawned at construction exited for good the moment
    /// `is_running()` went false.
    fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.tick_interval);
            loop {
                interval.tick().await;
                if !node.is_running() {
                    break;
                }
                node.tick();
            }
        })
    }

    /// Stops the node cooperatively. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn simulate_failure(&self) {
        self.stop();
        self.bus.publish(&NodeEvent::NodeFailure { node_id: self.id });
    }

    /// Restores a stopped node: resumes running as a `Follower`,
    /// increments its pre-failure term by one (a local convention, not a
    /// Raft requirement — see the design notes), clears its vote, redraws
    /// its timeout, and forces an election check on the very next tick.
    ///
    /// The tick loop spawned by `start()` exits for good once the node
    /// stops running, so restoring has to spawn a fresh one — otherwise a
    /// restored node would stay forever unticked, able to receive messages
    /// but never able to notice its own election timeout. Returns the new
    /// join handle (`None` if the node was already running) so the caller
    /// can fold it into whatever set of handles `stop()` later aborts.
    pub fn restore(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.is_running() {
            return None;
        }
        let timeout = self.config.draw_timeout();
        {
            let mut state = self.state.write();
            state.role = Role::Follower;
            state.current_term += 1;
            state.voted_for = None;
            state.election_timeout = timeout;
            state.last_heartbeat_time = Instant::now() - timeout - Duration::from_millis(1);
        }
        self.running.store(true, Ordering::SeqCst);
        self.bus.publish(&NodeEvent::NodeRestore { node_id: self.id });
        Some(self.spawn_tick_loop())
    }

    /// Delivers one envelope addressed to this node. A stopped node drops
    /// everything silently (invariant I7).
    pub fn receive_message(&self, envelope: Envelope) {
        if !self.is_running() {
            return;
        }
        match envelope.kind {
            MessageKind::RequestVote => self.handle_request_vote(envelope.from, envelope.term),
            MessageKind::VoteResponse { vote_granted } => {
                self.handle_vote_response(envelope.term, vote_granted)
            }
            MessageKind::AppendEntries { .. } => {
                self.handle_append_entries(envelope.from, envelope.term)
            }
            MessageKind::AppendEntriesResponse { .. } => {
                // Accepted and ignored: no log replication is modeled.
            }
        }
    }

    fn tick(&self) {
        if !self.is_running() {
            return;
        }
        let role = self.state.read().role;
        match role {
            Role::Leader => self.maybe_send_heartbeats(),
            _ => self.maybe_begin_election(),
        }
    }

    /// Sends a heartbeat batch if this node is still `Leader` and the
    /// broadcast cadence has elapsed — re-checked atomically under a single
    /// write-lock acquisition, since the role read in `tick()` and any
    /// earlier read here can be stale by the time a send would happen: a
    /// concurrently delivered higher-term message can step this node down
    /// between them. Emitting `AppendEntries` after that window would
    /// violate invariant I5.
    fn maybe_send_heartbeats(&self) {
        let term_to_send = {
            let mut state = self.state.write();
            if state.role != Role::Leader {
                None
            } else if state.last_heartbeat_broadcast.elapsed() >= self.config.heartbeat_interval {
                state.last_heartbeat_broadcast = Instant::now();
                Some(state.current_term)
            } else {
                None
            }
        };
        if let Some(term) = term_to_send {
            self.send_heartbeats(term);
        }
    }

    fn maybe_begin_election(&self) {
        let expired = {
            let state = self.state.read();
            state.last_heartbeat_time.elapsed() > state.election_timeout
        };
        if expired {
            self.begin_election();
        }
    }

    fn begin_election(&self) {
        let term = {
            let mut state = self.state.write();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.id);
            state.votes_received = 1;
            state.election_timeout = self.config.draw_timeout();
            state.last_heartbeat_time = Instant::now();
            state.current_term
        };
        debug!(node_id = self.id, term, "starting election");
        self.publish_state_change(Role::Candidate, term);
        self.broadcast(|_to| MessageKind::RequestVote, term);
    }

    fn send_heartbeats(&self, term: Term) {
        trace!(node_id = self.id, term, "sending heartbeat batch");
        self.broadcast(|_to| MessageKind::AppendEntries { entries: Vec::new() }, term);
    }

    fn handle_request_vote(&self, candidate: NodeId, term: Term) {
        let (reply_term, grant, adopted) = {
            let mut state = self.state.write();
            let adopted = state.adopt_term_if_newer(term);
            let grant = term >= state.current_term
                && (state.voted_for.is_none() || state.voted_for == Some(candidate));
            if grant {
                state.voted_for = Some(candidate);
                state.last_heartbeat_time = Instant::now();
            }
            (state.current_term, grant, adopted)
        };
        if adopted {
            self.publish_state_change(Role::Follower, reply_term);
        }
        self.reply(candidate, MessageKind::VoteResponse { vote_granted: grant }, reply_term);
    }

    fn handle_vote_response(&self, term: Term, vote_granted: bool) {
        let mut became_leader = None;
        let mut stepped_down = None;
        {
            let mut state = self.state.write();
            if state.role != Role::Candidate {
                return;
            }
            if state.adopt_term_if_newer(term) {
                stepped_down = Some(state.current_term);
            } else if vote_granted && term == state.current_term {
                state.votes_received += 1;
                if state.votes_received > self.node_count / 2 {
                    state.role = Role::Leader;
                    state.last_heartbeat_broadcast =
                        Instant::now() - self.config.heartbeat_interval - Duration::from_millis(1);
                    became_leader = Some(state.current_term);
                }
            }
        }
        if let Some(term) = stepped_down {
            self.publish_state_change(Role::Follower, term);
            return;
        }
        if let Some(term) = became_leader {
            self.publish_state_change(Role::Leader, term);
            self.maybe_send_heartbeats();
        }
    }

    fn handle_append_entries(&self, leader: NodeId, term: Term) {
        let (reply_term, success, adopted, stepped_down_from_candidate) = {
            let mut state = self.state.write();
            let adopted = state.adopt_term_if_newer(term);
            let success = term >= state.current_term;
            let mut stepped_down = false;
            if success {
                state.last_heartbeat_time = Instant::now();
                if state.role == Role::Candidate {
                    state.role = Role::Follower;
                    stepped_down = true;
                }
            }
            (state.current_term, success, adopted, stepped_down)
        };
        if adopted || stepped_down_from_candidate {
            self.publish_state_change(Role::Follower, reply_term);
        }
        self.reply(leader, MessageKind::AppendEntriesResponse { success }, reply_term);
    }

    fn broadcast(&self, kind: impl Fn(NodeId) -> MessageKind, term: Term) {
        for peer in 0..self.node_count {
            if peer == self.id {
                continue;
            }
            self.send(peer, kind(peer), term);
        }
    }

    fn reply(&self, to: NodeId, kind: MessageKind, term: Term) {
        self.send(to, kind, term);
    }

    fn send(&self, to: NodeId, kind: MessageKind, term: Term) {
        let envelope = Envelope::new(kind, self.id, to, term);
        self.bus.publish(&NodeEvent::MessageSent(envelope));
    }

    fn publish_state_change(&self, role: Role, term: Term) {
        self.bus.publish(&NodeEvent::StateChange { node_id: self.id, role, term });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::observer::ObserverBus;
    use parking_lot::Mutex;

    /// Scenario 6: two `RequestVote` envelopes from the same candidate in
    /// a fresh term are both granted (idempotent re-affirmation); a third
    /// from a different candidate in the same term is refused.
    #[test]
    fn idempotent_vote_within_term() {
        let bus: NodeBus = Arc::new(ObserverBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_for_sub = Arc::clone(&events);
        bus.subscribe(move |event: &NodeEvent| events_for_sub.lock().push(event.clone()));

        let node = Node::new(1, 5, ElectionConfig::default(), bus);
        // Bypass start()'s background tick task for this synchronous test.
        node.running.store(true, Ordering::SeqCst);

        let candidate_a = 0;
        let candidate_c = 2;
        let term = 5;

        node.receive_message(Envelope::new(MessageKind::RequestVote, candidate_a, 1, term));
        node.receive_message(Envelope::new(MessageKind::RequestVote, candidate_a, 1, term));
        node.receive_message(Envelope::new(MessageKind::RequestVote, candidate_c, 1, term));

        let grants: Vec<(NodeId, bool)> = events
            .lock()
            .iter()
            .filter_map(|event| match event {
                NodeEvent::MessageSent(envelope) => match envelope.kind {
                    MessageKind::VoteResponse { vote_granted } => Some((envelope.to, vote_granted)),
                    _ => None,
                },
                _ => None,
            })
            .collect();

        assert_eq!(grants, vec![(candidate_a, true), (candidate_a, true), (candidate_c, false)]);
    }

    #[test]
    fn begin_election_votes_for_self_and_broadcasts_request_vote() {
        let bus: NodeBus = Arc::new(ObserverBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_for_sub = Arc::clone(&events);
        bus.subscribe(move |event: &NodeEvent| events_for_sub.lock().push(event.clone()));

        let node = Node::new(2, 4, ElectionConfig::default(), bus);
        node.running.store(true, Ordering::SeqCst);

        node.begin_election();

        assert_eq!(node.snapshot().role, Role::Candidate);
        assert_eq!(node.snapshot().term, 1);

        let request_votes: Vec<NodeId> = events
            .lock()
            .iter()
            .filter_map(|event| match event {
                NodeEvent::MessageSent(envelope) if matches!(envelope.kind, MessageKind::RequestVote) => {
                    Some(envelope.to)
                }
                _ => None,
            })
            .collect();
        assert_eq!(request_votes, vec![0, 1, 3], "should broadcast to every peer but itself");
    }

    #[test]
    fn majority_of_four_is_three_votes() {
        let bus: NodeBus = Arc::new(ObserverBus::new());
        let node = Node::new(0, 4, ElectionConfig::default(), bus);
        node.running.store(true, Ordering::SeqCst);
        node.begin_election();
        assert_eq!(node.snapshot().role, Role::Candidate);

        node.handle_vote_response(1, true);
        assert_eq!(node.snapshot().role, Role::Candidate, "two votes is not yet a majority of four");

        node.handle_vote_response(1, true);
        assert_eq!(node.snapshot().role, Role::Leader, "three votes is a majority of four");
    }

    #[test]
    fn higher_term_append_entries_steps_down_a_candidate() {
        let bus: NodeBus = Arc::new(ObserverBus::new());
        let node = Node::new(0, 5, ElectionConfig::default(), bus);
        node.running.store(true, Ordering::SeqCst);
        node.begin_election();
        assert_eq!(node.snapshot().role, Role::Candidate);

        node.receive_message(Envelope::new(
            MessageKind::AppendEntries { entries: Vec::new() },
            3,
            0,
            99,
        ));

        let snapshot = node.snapshot();
        assert_eq!(snapshot.role, Role::Follower);
        assert_eq!(snapshot.term, 99);
    }

    /// `restore()` spawns a fresh tick-loop task, so it needs a runtime to
    /// spawn onto; a single-threaded `#[tokio::test]` runtime only polls
    /// that spawned task when this test function itself yields, so the
    /// synchronous assertions below still observe the state exactly as
    /// `restore()` left it.
    #[tokio::test]
    async fn restore_resumes_as_follower_with_incremented_term() {
        let bus: NodeBus = Arc::new(ObserverBus::new());
        let node = Arc::new(Node::new(0, 5, ElectionConfig::default(), bus));
        node.running.store(true, Ordering::SeqCst);
        node.begin_election(); // term 1, Candidate
        node.stop();
        assert!(!node.is_running());

        let handle = node.restore();

        assert!(node.is_running());
        let snapshot = node.snapshot();
        assert_eq!(snapshot.role, Role::Follower);
        assert_eq!(snapshot.term, 2);

        handle.expect("a stopped node must spawn a fresh tick loop on restore").abort();
    }
}
