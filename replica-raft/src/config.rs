//! Consensus configuration

use rand::Rng;
use replica_core::{Member, ReplicaError, Result, Roster};
use std::time::Duration;

/// Configuration for a consensus node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's identity and RPC address
    pub member: Member,
    /// Bootstrap roster. Leave it without `member` for a node that joins an
    /// existing cluster; such a node waits to be added before campaigning.
    pub members: Vec<Member>,
    /// Election timeout range (randomized between min and max)
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Heartbeat interval; must be well below the election timeout
    pub heartbeat_interval: Duration,
    /// Upper bound on a single RPC round trip
    pub rpc_timeout: Duration,
    /// Maximum number of entries in one AppendEntries request
    pub max_append_entries: usize,
    /// Applied entries since the last snapshot before compacting (0 disables)
    pub snapshot_threshold: u64,
    /// Bytes of snapshot data per InstallSnapshot request
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        let member = Member::new("node1", "127.0.0.1:7001");
        Self {
            members: vec![member.clone()],
            member,
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(500),
            max_append_entries: 256,
            snapshot_threshold: 10000,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

impl RaftConfig {
    /// Configuration for `member` bootstrapping with `members`
    pub fn new(member: Member, members: Vec<Member>) -> Self {
        Self {
            member,
            members,
            ..Default::default()
        }
    }

    /// Check the configuration for values that would break the protocol
    pub fn validate(&self) -> Result<()> {
        if self.member.id.as_str().is_empty() {
            return Err(ReplicaError::Configuration(
                "member id must not be empty".to_string(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ReplicaError::Configuration(format!(
                "election timeout min {:?} exceeds max {:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ReplicaError::Configuration(format!(
                "heartbeat interval {:?} must be below election timeout {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_append_entries == 0 {
            return Err(ReplicaError::Configuration(
                "max_append_entries must be positive".to_string(),
            ));
        }
        if self.snapshot_chunk_size == 0 {
            return Err(ReplicaError::Configuration(
                "snapshot_chunk_size must be positive".to_string(),
            ));
        }
        let ids: std::collections::HashSet<_> = self.members.iter().map(|m| &m.id).collect();
        if ids.len() != self.members.len() {
            return Err(ReplicaError::Configuration(
                "bootstrap roster lists a member twice".to_string(),
            ));
        }
        Ok(())
    }

    /// The bootstrap roster
    pub fn roster(&self) -> Roster {
        Roster::new(self.members.iter().cloned())
    }

    /// Generate a random election timeout
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        if max <= min {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
