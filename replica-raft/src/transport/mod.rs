//! RPC transport
//!
//! The consensus context talks to peers only through [`Transport`] and
//! receives their calls through [`RpcHandler`]. Transports may drop, delay
//! or duplicate calls; the receiver's consistency checks keep that safe.

mod local;
mod tcp;

pub use local::{LocalNetwork, LocalTransport};
pub use tcp::{RpcServer, TcpTransport};

use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftRequest, RaftResponse, RequestVoteRequest, RequestVoteResponse,
};
use async_trait::async_trait;
use replica_core::{Member, ReplicaError, Result};

/// Outbound RPC primitives addressed by member
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for the matching response
    async fn call(&self, target: &Member, request: RaftRequest) -> Result<RaftResponse>;

    async fn request_vote(
        &self,
        target: &Member,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.call(target, RaftRequest::RequestVote(request)).await? {
            RaftResponse::RequestVote(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        target: &Member,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(target, RaftRequest::AppendEntries(request)).await? {
            RaftResponse::AppendEntries(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &self,
        target: &Member,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        match self.call(target, RaftRequest::InstallSnapshot(request)).await? {
            RaftResponse::InstallSnapshot(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

/// Inbound side: processes a request from a peer
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: RaftRequest) -> RaftResponse;
}

fn unexpected(response: RaftResponse) -> ReplicaError {
    match response {
        RaftResponse::Error(msg) => ReplicaError::Network(msg),
        other => ReplicaError::Network(format!("Unexpected response type: {:?}", other)),
    }
}
