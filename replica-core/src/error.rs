//! Error types for the replica system

use crate::types::{LogIndex, Member};
use std::time::Duration;
use thiserror::Error;

/// Core error type for the replica system
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// This node is not the leader; carries the known leader, if any
    #[error("Not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<Member> },

    /// The submitted entry was truncated before it could commit
    #[error("Submission at index {index} was lost before commit")]
    SubmissionLost { index: LogIndex },

    /// The node stopped before the entry's fate was decided
    #[error("Submission at index {index} was not committed")]
    NotCommitted { index: LogIndex },

    /// A membership change is already in flight
    #[error("A membership change is already in progress at index {0}")]
    MembershipChangeInProgress(LogIndex),

    /// The requested membership change is not valid for the current roster
    #[error("Invalid membership change: {0}")]
    InvalidMembershipChange(String),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// The state machine rejected a committed command
    #[error("State machine error: {0}")]
    StateMachine(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// RPC timeout exceeded
    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The node has been stopped
    #[error("Node is shut down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicaError {
    /// Whether a failed submission may be retried, possibly against another node
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. }
                | Self::SubmissionLost { .. }
                | Self::NotCommitted { .. }
                | Self::MembershipChangeInProgress(_)
        )
    }

    /// Leader redirect hint, if this is a not-leader rejection
    pub fn leader_hint(&self) -> Option<&Member> {
        match self {
            Self::NotLeader { leader } => leader.as_ref(),
            _ => None,
        }
    }
}

impl From<bincode::Error> for ReplicaError {
    fn from(e: bincode::Error) -> Self {
        ReplicaError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(e: serde_json::Error) -> Self {
        ReplicaError::Serialization(e.to_string())
    }
}

/// Result type alias for replica operations
pub type Result<T> = std::result::Result<T, ReplicaError>;
