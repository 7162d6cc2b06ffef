//! In-process transport
//!
//! Routes calls directly to registered handlers. Links can be cut to
//! simulate partitions and crashed nodes.

use super::{RpcHandler, Transport};
use crate::rpc::{RaftRequest, RaftResponse};
use async_trait::async_trait;
use parking_lot::RwLock;
use replica_core::{Member, MemberId, ReplicaError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<MemberId, Arc<dyn RpcHandler>>,
    /// Directed links that drop traffic
    blocked: HashSet<(MemberId, MemberId)>,
    latency: Duration,
}

/// A simulated network shared by every node of a test cluster
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls addressed to `id` to `handler`
    pub fn register(&self, id: MemberId, handler: Arc<dyn RpcHandler>) {
        self.state.write().handlers.insert(id, handler);
    }

    /// Remove a node; calls to it fail as if it crashed
    pub fn unregister(&self, id: &MemberId) {
        self.state.write().handlers.remove(id);
    }

    /// Transport used by node `id` to reach its peers
    pub fn transport(&self, id: MemberId) -> LocalTransport {
        LocalTransport {
            from: id,
            network: self.clone(),
        }
    }

    /// Delay every call by `latency` in each direction
    pub fn set_latency(&self, latency: Duration) {
        self.state.write().latency = latency;
    }

    /// Drop traffic from `from` to `to` (one direction)
    pub fn block(&self, from: &MemberId, to: &MemberId) {
        self.state.write().blocked.insert((from.clone(), to.clone()));
    }

    /// Cut `id` off from every other registered node, both directions
    pub fn isolate(&self, id: &MemberId) {
        let mut state = self.state.write();
        let others: Vec<MemberId> = state.handlers.keys().filter(|o| *o != id).cloned().collect();
        for other in others {
            state.blocked.insert((id.clone(), other.clone()));
            state.blocked.insert((other, id.clone()));
        }
    }

    /// Split the cluster into groups that cannot reach each other
    pub fn partition(&self, groups: &[Vec<MemberId>]) {
        let mut state = self.state.write();
        for (i, a) in groups.iter().enumerate() {
            for (j, b) in groups.iter().enumerate() {
                if i == j {
                    continue;
                }
                for from in a {
                    for to in b {
                        state.blocked.insert((from.clone(), to.clone()));
                    }
                }
            }
        }
    }

    /// Restore every link
    pub fn heal(&self) {
        self.state.write().blocked.clear();
    }

    fn reachable(&self, from: &MemberId, to: &MemberId) -> bool {
        !self.state.read().blocked.contains(&(from.clone(), to.clone()))
    }

    fn route(&self, from: &MemberId, to: &MemberId) -> Option<(Arc<dyn RpcHandler>, Duration)> {
        let state = self.state.read();
        if state.blocked.contains(&(from.clone(), to.clone())) {
            return None;
        }
        state.handlers.get(to).map(|h| (h.clone(), state.latency))
    }
}

/// One node's view of a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalTransport {
    from: MemberId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, target: &Member, request: RaftRequest) -> Result<RaftResponse> {
        let (handler, latency) = self
            .network
            .route(&self.from, &target.id)
            .ok_or_else(|| ReplicaError::Network(format!("{} is unreachable", target.id)))?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let response = handler.handle(request).await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // The reply travels the reverse link, which may have been cut meanwhile.
        if !self.network.reachable(&target.id, &self.from) {
            return Err(ReplicaError::Network(format!(
                "Response from {} was dropped",
                target.id
            )));
        }
        Ok(response)
    }
}
