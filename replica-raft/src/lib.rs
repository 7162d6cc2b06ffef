//! Raft Consensus Implementation
//!
//! This crate replicates a deterministic state machine across a cluster:
//! leader election, log replication, single-member roster changes,
//! snapshots, and the transports nodes use to reach each other.

pub mod config;
pub mod event;
pub mod log;
pub mod raft;
pub mod replica;
pub mod rpc;
pub mod state_machine;
pub mod transport;

pub use config::RaftConfig;
pub use event::{EventBus, EventNotifier, NoopNotifier, RaftEvent};
pub use log::{EntryPayload, HardState, LogEntry, LogStore, MemoryLogStore, Snapshot, SnapshotMeta};
pub use raft::{MembershipChange, PendingSubmission, Raft, RaftStatus};
pub use replica::{Replica, Service, SubmitHandle};
pub use state_machine::{KvCommand, KvOutput, KvQuery, KvStateMachine, StateMachine};
pub use transport::{LocalNetwork, LocalTransport, RpcHandler, RpcServer, TcpTransport, Transport};
