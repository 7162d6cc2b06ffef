//! Raft consensus node
//!
//! [`Raft`] is a cheap, cloneable handle. All consensus state lives in a
//! single [`Core`] behind a mutex that is never held across an `.await`;
//! background tasks (the election timer, one replication task per follower,
//! vote requests) take the lock, decide, release it and only then talk to the
//! network.

mod apply;
mod election;
mod membership;
mod replication;
mod snapshot;
mod state;
mod submission;

pub use membership::MembershipChange;
pub use submission::PendingSubmission;

use crate::config::RaftConfig;
use crate::event::EventNotifier;
use crate::log::{EntryPayload, LogStore};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftRequest, RaftResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state_machine::StateMachine;
use crate::transport::{RpcHandler, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use replica_core::{
    LogIndex, Member, MemberId, NodeRole, ReplicaError, Result, Roster, Term,
};
use serde::{Deserialize, Serialize};
use state::{Core, Replicator};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: MemberId,
    pub role: NodeRole,
    pub term: Term,
    pub leader: Option<MemberId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub roster: Roster,
}

pub(crate) struct Shared {
    config: RaftConfig,
    core: Mutex<Core>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    started: AtomicBool,
    /// Every background task; `stop` waits for all of them
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Run an outbound RPC under the configured deadline
    async fn rpc<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.rpc_timeout, call)
            .await
            .map_err(|_| ReplicaError::Timeout(self.config.rpc_timeout))?
    }

    /// Run `task` in the background unless the node is stopping. Checked
    /// under the task list lock so `stop` cannot miss a task.
    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock();
        if self.shutdown.is_cancelled() {
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task));
    }

    fn spawn_replicators(self: &Arc<Self>, replicators: Vec<Replicator>) {
        for replicator in replicators {
            self.spawn(self.clone().replicate(replicator));
        }
    }
}

/// Handle to a running Raft node
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
}

impl Raft {
    /// Create a node from its configuration and durable state. Committed
    /// entries found in `store` are replayed into `state_machine` before
    /// this returns. Call [`Raft::start`] to begin participating.
    pub fn new(
        config: RaftConfig,
        store: impl LogStore + 'static,
        state_machine: impl StateMachine + 'static,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Result<Self> {
        config.validate()?;
        let core = Core::recover(
            config.clone(),
            Box::new(store),
            Box::new(state_machine),
            notifier,
        )?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                core: Mutex::new(core),
                transport,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the election timer. Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ReplicaError::Shutdown);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.core.lock().reset_election_timer();
        self.shared.spawn(self.shared.clone().run_election_timer());
        info!("Raft node {} started", self.shared.config.member);
        Ok(())
    }

    /// Stop all background work. Pending submissions fail with an unknown
    /// outcome. The node cannot be restarted.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        self.shared.core.lock().shutdown();
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Raft node {} stopped", self.shared.config.member.id);
    }

    /// Append a command and return a future for its outcome
    pub fn propose(&self, command: Vec<u8>) -> Result<PendingSubmission> {
        self.shared
            .core
            .lock()
            .propose(EntryPayload::Command(command))
    }

    /// Submit a command and wait until it is applied; returns the state
    /// machine's output
    pub async fn submit(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.propose(command)?.await
    }

    /// Add a member; resolves with the new roster once the change commits
    pub async fn add_member(&self, member: Member) -> Result<Roster> {
        self.change_membership(MembershipChange::Add(member)).await
    }

    /// Remove a member; resolves with the new roster once the change commits
    pub async fn remove_member(&self, id: MemberId) -> Result<Roster> {
        self.change_membership(MembershipChange::Remove(id)).await
    }

    async fn change_membership(&self, change: MembershipChange) -> Result<Roster> {
        let (pending, replicator) = self.shared.core.lock().propose_membership(change)?;
        self.shared.spawn_replicators(replicator.into_iter().collect());
        pending.await?;
        Ok(self.roster())
    }

    /// Read from the local state machine. Reflects every applied entry on
    /// this node but may lag the leader.
    pub fn query(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.shared
            .core
            .lock()
            .state_machine
            .query(request)
            .map_err(ReplicaError::StateMachine)
    }

    /// Snapshot now and compact the log; returns the snapshot index
    pub fn compact(&self) -> Result<LogIndex> {
        self.shared.core.lock().compact()
    }

    pub fn status(&self) -> RaftStatus {
        let core = self.shared.core.lock();
        RaftStatus {
            id: core.id.clone(),
            role: core.role,
            term: core.hard.term,
            leader: core.leader_id.clone(),
            commit_index: core.commit_index,
            last_applied: core.last_applied,
            last_log_index: core.store.last_index(),
            snapshot_index: core.store.snapshot_index(),
            roster: core.roster.clone(),
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.shared.config.member.id
    }

    pub fn is_leader(&self) -> bool {
        self.shared.core.lock().role == NodeRole::Leader
    }

    pub fn term(&self) -> Term {
        self.shared.core.lock().term()
    }

    /// Currently known leader, if any
    pub fn leader(&self) -> Option<Member> {
        self.shared.core.lock().leader_member()
    }

    pub fn roster(&self) -> Roster {
        self.shared.core.lock().roster.clone()
    }

    /// Handle AppendEntries RPC
    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        self.shared.core.lock().handle_append_entries(req)
    }

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        self.shared.core.lock().handle_request_vote(req)
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        self.shared.core.lock().handle_install_snapshot(req)
    }
}

#[async_trait]
impl RpcHandler for Raft {
    async fn handle(&self, request: RaftRequest) -> RaftResponse {
        match request {
            RaftRequest::AppendEntries(req) => {
                RaftResponse::AppendEntries(self.handle_append_entries(req))
            }
            RaftRequest::RequestVote(req) => RaftResponse::RequestVote(self.handle_request_vote(req)),
            RaftRequest::InstallSnapshot(req) => {
                RaftResponse::InstallSnapshot(self.handle_install_snapshot(req))
            }
        }
    }
}
