//! Replica facade
//!
//! Wires a [`Raft`] node to the client-facing [`Service`] that accepts
//! commands, and exposes the node's event stream.

use crate::config::RaftConfig;
use crate::event::{EventBus, RaftEvent};
use crate::log::LogStore;
use crate::raft::{Raft, RaftStatus};
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use async_trait::async_trait;
use replica_core::{Member, MemberId, Result, Roster};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// What a [`Service`] can ask of the replica
#[derive(Clone)]
pub struct SubmitHandle {
    raft: Raft,
}

impl SubmitHandle {
    /// Replicate a command; resolves with the state machine's output
    pub async fn submit(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.raft.submit(command).await
    }

    /// Read from the local state machine
    pub fn query(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.raft.query(request)
    }

    pub async fn add_member(&self, member: Member) -> Result<Roster> {
        self.raft.add_member(member).await
    }

    pub async fn remove_member(&self, id: MemberId) -> Result<Roster> {
        self.raft.remove_member(id).await
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }

    pub fn leader(&self) -> Option<Member> {
        self.raft.leader()
    }
}

impl From<Raft> for SubmitHandle {
    fn from(raft: Raft) -> Self {
        Self { raft }
    }
}

/// Client-facing front end of a replica. It receives a [`SubmitHandle`]
/// before it starts and forwards client commands through it.
#[async_trait]
pub trait Service: Send + Sync {
    fn bind(&mut self, handle: SubmitHandle);

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

/// A Raft node together with its client service
pub struct Replica<S: Service> {
    raft: Raft,
    service: S,
    events: EventBus,
}

impl<S: Service> Replica<S> {
    /// Recover the node from `store` and bind `service` to it
    pub fn open(
        config: RaftConfig,
        store: impl LogStore + 'static,
        state_machine: impl StateMachine + 'static,
        transport: Arc<dyn Transport>,
        mut service: S,
    ) -> Result<Self> {
        let events = EventBus::default();
        let raft = Raft::new(
            config,
            store,
            state_machine,
            transport,
            Arc::new(events.clone()),
        )?;
        service.bind(SubmitHandle::from(raft.clone()));
        Ok(Self {
            raft,
            service,
            events,
        })
    }

    /// The underlying consensus node
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn events(&self) -> broadcast::Receiver<RaftEvent> {
        self.events.subscribe()
    }

    /// Start consensus, then the service
    pub async fn start(&mut self) -> Result<()> {
        self.raft.start().await?;
        self.service.start().await?;
        info!("Replica {} started", self.raft.id());
        Ok(())
    }

    /// Stop the service, then consensus
    pub async fn stop(&mut self) -> Result<()> {
        let stopped = self.service.stop().await;
        self.raft.stop().await;
        info!("Replica {} stopped", self.raft.id());
        stopped
    }
}
