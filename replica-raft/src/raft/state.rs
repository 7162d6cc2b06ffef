//! Node state guarded by the consensus critical section
//!
//! Every mutation of term, role, log and commit index goes through a
//! `&mut Core` obtained from the single mutex in [`super::Shared`]. Nothing in
//! here awaits; asynchronous work is returned to the caller as plain data.

use crate::config::RaftConfig;
use crate::event::{EventNotifier, RaftEvent};
use crate::log::{HardState, LogStore};
use crate::state_machine::StateMachine;
use replica_core::{
    LogIndex, Member, MemberId, NodeRole, ReplicaError, Result, Roster, Term,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Submission awaiting its entry's fate
pub(super) struct Pending {
    pub term: Term,
    pub tx: oneshot::Sender<Result<Vec<u8>>>,
}

/// Snapshot being streamed to a follower
#[derive(Debug, Clone, Copy)]
pub(super) struct SnapshotTransfer {
    pub index: LogIndex,
    pub offset: u64,
}

/// Leader's view of one follower
pub(super) struct Progress {
    pub member: Member,
    /// Next log index to send
    pub next_index: LogIndex,
    /// Highest index known replicated
    pub match_index: LogIndex,
    /// Wakes the follower's replication task
    pub notify: Arc<Notify>,
    /// Identifies the task that owns this follower
    pub task_id: u64,
    pub snapshot: Option<SnapshotTransfer>,
}

/// State only a leader holds
pub(super) struct LeaderState {
    pub progress: HashMap<MemberId, Progress>,
    /// Index of the uncommitted membership entry, if one is in flight
    pub pending_membership: Option<LogIndex>,
}

/// A replication task the caller must spawn after releasing the lock
#[derive(Debug, Clone)]
pub(super) struct Replicator {
    pub peer: MemberId,
    pub term: Term,
    pub task_id: u64,
    pub notify: Arc<Notify>,
}

/// Snapshot chunks received so far
pub(super) struct IncomingSnapshot {
    pub index: LogIndex,
    pub term: Term,
    pub data: Vec<u8>,
}

pub(super) struct Core {
    pub id: MemberId,
    pub config: RaftConfig,
    pub notifier: Arc<dyn EventNotifier>,
    pub store: Box<dyn LogStore>,
    pub state_machine: Box<dyn StateMachine>,

    pub hard: HardState,
    pub role: NodeRole,
    pub leader_id: Option<MemberId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Roster of the last applied membership entry (or snapshot, or bootstrap)
    pub roster: Roster,

    pub election_deadline: Instant,
    pub last_leader_contact: Option<Instant>,
    pub votes: HashSet<MemberId>,
    pub leader: Option<LeaderState>,
    pub pending: BTreeMap<LogIndex, Pending>,
    pub incoming_snapshot: Option<IncomingSnapshot>,

    /// Set after a log store failure until a flush succeeds again
    pub storage_fault: Option<String>,
    pub stopped: bool,
    /// Startup replay: apply silently
    pub replaying: bool,
    next_task_id: u64,
}

impl Core {
    /// Build the node state from durable storage
    pub fn recover(
        config: RaftConfig,
        store: Box<dyn LogStore>,
        mut state_machine: Box<dyn StateMachine>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Result<Self> {
        let hard = store.hard_state();
        let mut roster = config.roster();
        let mut applied = 0;

        if let Some(snapshot) = store.snapshot() {
            state_machine
                .restore(&snapshot.data)
                .map_err(ReplicaError::StateMachine)?;
            roster = snapshot.meta.roster;
            applied = snapshot.meta.last_included_index;
            info!(
                "Restored state machine from snapshot at index {}",
                applied
            );
        }

        let election_deadline = Instant::now() + config.random_election_timeout();
        let mut core = Self {
            id: config.member.id.clone(),
            config,
            notifier,
            store,
            state_machine,
            hard,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: applied,
            last_applied: applied,
            roster,
            election_deadline,
            last_leader_contact: None,
            votes: HashSet::new(),
            leader: None,
            pending: BTreeMap::new(),
            incoming_snapshot: None,
            storage_fault: None,
            stopped: false,
            replaying: false,
            next_task_id: 0,
        };

        let target = core.hard.commit.min(core.store.last_index());
        if target > core.commit_index {
            core.replaying = true;
            core.commit_index = target;
            core.apply_committed();
            core.replaying = false;
            info!(
                "Replayed committed entries through index {}",
                core.last_applied
            );
        }

        info!(
            "Node {} recovered at term {} (last index {}, commit {})",
            core.id,
            core.hard.term,
            core.store.last_index(),
            core.commit_index
        );
        Ok(core)
    }

    pub fn term(&self) -> Term {
        self.hard.term
    }

    pub fn next_task_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Durably save `next` and only then adopt it. A failure leaves the
    /// in-memory hard state untouched and puts the node into storage-fault
    /// mode.
    pub fn persist_hard_state(&mut self, next: HardState) -> Result<()> {
        if let Err(e) = self.store.save_hard_state(&next) {
            self.storage_failed(&e);
            return Err(e);
        }
        self.hard = next;
        Ok(())
    }

    /// Durably raise the commit lower bound
    pub fn persist_commit(&mut self, commit: LogIndex) -> Result<()> {
        if commit <= self.hard.commit {
            return Ok(());
        }
        let next = HardState {
            commit,
            ..self.hard.clone()
        };
        self.persist_hard_state(next)
    }

    /// Record a storage failure: step down and refuse to serve until a check
    /// succeeds.
    pub fn storage_failed(&mut self, err: &ReplicaError) {
        error!("Storage failure on node {}: {}", self.id, err);
        let first = self.storage_fault.is_none();
        self.storage_fault = Some(err.to_string());
        self.leader = None;
        self.votes.clear();
        self.set_role(NodeRole::Follower);
        if first {
            self.notifier.notify(RaftEvent::StorageFailed {
                reason: err.to_string(),
            });
        }
    }

    /// Retry the durability barrier; clears the fault when it succeeds
    pub fn check_storage(&mut self) {
        match self.store.flush() {
            Ok(()) => {
                info!("Storage on node {} is healthy again", self.id);
                self.storage_fault = None;
                self.notifier.notify(RaftEvent::StorageRecovered);
            }
            Err(e) => debug!("Storage check failed: {}", e),
        }
    }

    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    pub fn set_role(&mut self, role: NodeRole) {
        if self.role == role {
            return;
        }
        info!(
            "Node {} is now {} for term {}",
            self.id, role, self.hard.term
        );
        self.role = role;
        self.notifier.notify(RaftEvent::RoleChanged {
            term: self.hard.term,
            role,
        });
    }

    /// Adopt `term` (if newer) and become a follower of `leader`
    pub fn become_follower(&mut self, term: Term, leader: Option<MemberId>) {
        if term > self.hard.term {
            let next = HardState {
                term,
                voted_for: None,
                commit: self.hard.commit,
            };
            if self.persist_hard_state(next).is_err() {
                return;
            }
        }
        if self.role == NodeRole::Leader {
            info!("Node {} stepping down in term {}", self.id, self.hard.term);
        }
        self.leader = None;
        self.votes.clear();
        self.set_role(NodeRole::Follower);
        self.observe_leader(leader);
    }

    /// Record the current leader, announcing it the first time it is seen
    pub fn observe_leader(&mut self, leader: Option<MemberId>) {
        if leader.is_some() && self.leader_id != leader {
            if let Some(id) = &leader {
                debug!("Node {} follows {} in term {}", self.id, id, self.hard.term);
                self.notifier.notify(RaftEvent::LeaderElected {
                    term: self.hard.term,
                    leader: id.clone(),
                });
            }
        }
        self.leader_id = leader;
    }

    /// Follow the sender of a leader RPC whose term is not stale. Returns
    /// false if the request must be refused.
    pub fn accept_leader(&mut self, term: Term, leader: &MemberId) -> bool {
        if self.role == NodeRole::Leader && term == self.hard.term {
            error!(
                "Node {} and {} both lead term {}",
                self.id, leader, term
            );
            return false;
        }
        if term > self.hard.term || self.role != NodeRole::Follower {
            self.become_follower(term, Some(leader.clone()));
            if self.storage_fault.is_some() {
                return false;
            }
        } else {
            self.observe_leader(Some(leader.clone()));
        }
        self.last_leader_contact = Some(Instant::now());
        self.reset_election_timer();
        true
    }

    /// Member record of the known leader
    pub fn leader_member(&self) -> Option<Member> {
        let id = self.leader_id.as_ref()?;
        if *id == self.id {
            return Some(self.config.member.clone());
        }
        self.roster.get(id).cloned().or_else(|| {
            self.leader
                .as_ref()
                .and_then(|l| l.progress.get(id))
                .map(|p| p.member.clone())
        })
    }

    pub fn not_leader(&self) -> ReplicaError {
        ReplicaError::NotLeader {
            leader: self.leader_member(),
        }
    }

    /// Check that this node may accept a new entry
    pub fn ensure_writable(&self) -> Result<()> {
        if self.stopped {
            return Err(ReplicaError::Shutdown);
        }
        if let Some(fault) = &self.storage_fault {
            return Err(ReplicaError::Storage(fault.clone()));
        }
        if self.role != NodeRole::Leader {
            return Err(self.not_leader());
        }
        Ok(())
    }

    /// Whether this node may start an election
    pub fn can_campaign(&self) -> bool {
        !self.stopped && self.storage_fault.is_none() && self.roster.contains(&self.id)
    }

    /// Wake every replication task so followers see new entries or a new
    /// commit index promptly
    pub fn wake_replicators(&self) {
        if let Some(leader) = &self.leader {
            for p in leader.progress.values() {
                p.notify.notify_one();
            }
        }
    }

    /// Register a follower with the leader state and describe its task
    pub fn track_follower(&mut self, member: Member, next_index: LogIndex) -> Option<Replicator> {
        if member.id == self.id {
            return None;
        }
        let task_id = self.next_task_id();
        let term = self.hard.term;
        let leader = self.leader.as_mut()?;
        let notify = Arc::new(Notify::new());
        let peer = member.id.clone();
        leader.progress.insert(
            peer.clone(),
            Progress {
                member,
                next_index,
                match_index: 0,
                notify: notify.clone(),
                task_id,
                snapshot: None,
            },
        );
        Some(Replicator {
            peer,
            term,
            task_id,
            notify,
        })
    }

    /// Fail pending submissions at or above `index` whose entries are gone
    pub fn fail_pending_from(&mut self, index: LogIndex) {
        let lost = self.pending.split_off(&index);
        for (index, pending) in lost {
            warn!("Submission at index {} lost to truncation", index);
            let _ = pending.tx.send(Err(ReplicaError::SubmissionLost { index }));
        }
    }

    /// Stop serving: fail every pending submission with an unknown outcome
    pub fn shutdown(&mut self) {
        self.stopped = true;
        self.leader = None;
        self.votes.clear();
        self.set_role(NodeRole::Follower);
        for (index, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.tx.send(Err(ReplicaError::NotCommitted { index }));
        }
    }
}
