//! Event notification
//!
//! The consensus context pushes lifecycle events into an [`EventNotifier`].
//! Notification is fire-and-forget: implementations must not block and
//! cannot fail the protocol.

use replica_core::{LogIndex, Member, MemberId, NodeRole, Roster, Term};
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle events emitted by the consensus context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftEvent {
    /// A leader won the election for `term`
    LeaderElected { term: Term, leader: MemberId },
    /// This node changed role
    RoleChanged { term: Term, role: NodeRole },
    /// A member joined the roster
    MemberJoined { member: Member, roster: Roster },
    /// A member left the roster
    MemberRemoved { member: Member, roster: Roster },
    /// An entry was committed and applied locally
    EntryCommitted { index: LogIndex, term: Term },
    /// The log was compacted into a snapshot
    SnapshotTaken { index: LogIndex },
    /// A snapshot from the leader replaced the local state
    SnapshotInstalled { index: LogIndex },
    /// Storage rejected a write; the node stopped serving
    StorageFailed { reason: String },
    /// A storage check succeeded and the node serves again
    StorageRecovered,
}

/// Sink for [`RaftEvent`]s
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: RaftEvent);
}

impl<F> EventNotifier for F
where
    F: Fn(RaftEvent) + Send + Sync,
{
    fn notify(&self, event: RaftEvent) {
        self(event)
    }
}

/// Notifier that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl EventNotifier for NoopNotifier {
    fn notify(&self, _event: RaftEvent) {}
}

/// Broadcast-backed event stream. Slow subscribers lose old events rather
/// than slowing the protocol.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RaftEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventNotifier for EventBus {
    fn notify(&self, event: RaftEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}
