//! Shared harness for multi-node tests over the in-process network

#![allow(dead_code)]

use replica_core::{Member, MemberId};
use replica_raft::{
    EventBus, KvCommand, KvQuery, KvStateMachine, LocalNetwork, LogStore, MemoryLogStore, Raft,
    RaftConfig, RaftEvent,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn id(i: usize) -> MemberId {
    MemberId::from(format!("node{}", i))
}

pub fn member(i: usize) -> Member {
    Member::new(format!("node{}", i), format!("local:{}", i))
}

/// Timings short enough for tests, with the heartbeat well below the
/// election timeout
pub fn test_config(i: usize, members: Vec<Member>) -> RaftConfig {
    let mut config = RaftConfig::new(member(i), members);
    config.election_timeout_min = Duration::from_millis(150);
    config.election_timeout_max = Duration::from_millis(300);
    config.heartbeat_interval = Duration::from_millis(30);
    config.rpc_timeout = Duration::from_millis(100);
    config.snapshot_threshold = 0;
    config.snapshot_chunk_size = 64;
    config
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `fut`, failing the test if it takes longer than [`WAIT`]
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("operation timed out")
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    KvCommand::Set {
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
    }
    .encode()
    .unwrap()
}

/// Value of `key` on one node's local state machine
pub fn value(raft: &Raft, key: &str) -> Option<String> {
    let bytes = raft
        .query(&KvQuery::Get {
            key: key.to_string(),
        }
        .encode()
        .unwrap())
        .ok()?;
    KvQuery::decode_value(&bytes)
        .ok()
        .flatten()
        .map(|v| String::from_utf8_lossy(&v).into_owned())
}

pub struct Cluster {
    pub network: LocalNetwork,
    pub nodes: BTreeMap<MemberId, Raft>,
    pub events: BTreeMap<MemberId, EventBus>,
}

impl Cluster {
    /// Start `size` nodes that bootstrap with each other
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, |_| {}).await
    }

    pub async fn start_with(size: usize, tweak: impl Fn(&mut RaftConfig)) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: BTreeMap::new(),
            events: BTreeMap::new(),
        };
        let members: Vec<Member> = (1..=size).map(member).collect();
        for i in 1..=size {
            let mut config = test_config(i, members.clone());
            tweak(&mut config);
            cluster
                .launch(config, MemoryLogStore::new())
                .await;
        }
        cluster
    }

    /// Start a node with the given configuration and log
    pub async fn launch(&mut self, config: RaftConfig, store: impl LogStore + 'static) -> Raft {
        let node_id = config.member.id.clone();
        let events = EventBus::default();
        let raft = Raft::new(
            config,
            store,
            KvStateMachine::new(),
            Arc::new(self.network.transport(node_id.clone())),
            Arc::new(events.clone()),
        )
        .expect("node should start");
        self.network.register(node_id.clone(), Arc::new(raft.clone()));
        raft.start().await.expect("node should start");
        self.nodes.insert(node_id.clone(), raft.clone());
        self.events.insert(node_id, events);
        raft
    }

    /// Start a node that is not yet part of the roster
    pub async fn launch_joiner(&mut self, i: usize) -> Raft {
        let roster: Vec<Member> = self
            .nodes
            .values()
            .next()
            .map(|r| r.roster().iter().cloned().collect())
            .unwrap_or_default();
        self.launch(test_config(i, roster), MemoryLogStore::new())
            .await
    }

    pub fn node(&self, i: usize) -> &Raft {
        &self.nodes[&id(i)]
    }

    pub fn subscribe(&self, i: usize) -> broadcast::Receiver<RaftEvent> {
        self.events[&id(i)].subscribe()
    }

    /// The leader among `among`, once exactly one of them leads the highest
    /// term seen
    pub fn leader_among(&self, among: &[MemberId]) -> Option<Raft> {
        let nodes: Vec<&Raft> = among.iter().filter_map(|i| self.nodes.get(i)).collect();
        let leaders: Vec<&&Raft> = nodes.iter().filter(|r| r.is_leader()).collect();
        if leaders.len() != 1 {
            return None;
        }
        let leader = leaders[0];
        let top_term = nodes.iter().map(|r| r.term()).max().unwrap_or(0);
        (leader.term() == top_term).then(|| (*leader).clone())
    }

    pub async fn wait_for_leader_among(&self, among: &[MemberId]) -> Raft {
        let mut found = None;
        let ok = wait_for(WAIT, || {
            found = self.leader_among(among);
            found.is_some()
        })
        .await;
        assert!(ok, "no single leader emerged among {:?}", among);
        found.expect("leader")
    }

    pub async fn wait_for_leader(&self) -> Raft {
        let all: Vec<MemberId> = self.nodes.keys().cloned().collect();
        self.wait_for_leader_among(&all).await
    }

    /// Wait until every node in `among` has applied through `index`
    pub async fn wait_for_applied(&self, among: &[MemberId], index: u64) -> bool {
        wait_for(WAIT, || {
            among
                .iter()
                .all(|i| self.nodes[i].status().last_applied >= index)
        })
        .await
    }

    pub async fn stop(self) {
        for raft in self.nodes.values() {
            raft.stop().await;
        }
    }
}
