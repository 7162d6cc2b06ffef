//! Consensus RPC messages

use crate::log::LogEntry;
use replica_core::{LogIndex, MemberId, Roster, Term};
use serde::{Deserialize, Serialize};

/// Raft RPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

/// Raft RPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    Error(String),
}

/// AppendEntries RPC request. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: MemberId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// Where the follower's log diverges from the leader's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    /// Term of the follower's conflicting entry, `None` when its log is too short
    pub term: Option<Term>,
    /// First index the follower holds for that term, or its `last_index + 1`
    pub index: LogIndex,
}

/// AppendEntries RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the highest index known to match the leader's log
    pub match_index: LogIndex,
    /// On a consistency-check failure, where to resume
    pub conflict: Option<ConflictHint>,
}

/// RequestVote RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// InstallSnapshot RPC request, one chunk of the leader's snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub roster: Roster,
    /// Byte offset of `data` within the snapshot
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

/// InstallSnapshot RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// Bytes the follower holds for this snapshot; the leader resumes here
    pub bytes_received: u64,
    /// The whole snapshot is installed
    pub installed: bool,
}
