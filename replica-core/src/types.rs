//! Common types used throughout the replica system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Election epoch. Never decreases on a node.
pub type Term = u64;

/// Position in the replicated log. Index 0 means "no entry".
pub type LogIndex = u64;

/// Unique identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A cluster member: identity plus the address its RPC endpoint listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub address: String,
}

impl Member {
    /// Create a new member
    pub fn new(id: impl Into<MemberId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Node role in the consensus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Passive: replicates from the leader and votes when asked
    Follower,
    /// Campaigning for leadership in the current term
    Candidate,
    /// Accepts submissions and drives replication
    Leader,
}

impl NodeRole {
    /// Check if this role may accept client submissions
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Follower
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        };
        f.write_str(name)
    }
}
