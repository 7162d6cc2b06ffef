//! State Machine
//!
//! This module defines the state machine interface driven by the consensus
//! context and provides an in-memory key-value implementation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trait for a replicated state machine
///
/// The state machine applies committed commands from the log in order.
/// Implementations must ensure that applying the same sequence of
/// commands always produces the same results.
pub trait StateMachine: Send {
    /// Apply a committed command and return its result
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>, String>;

    /// Read local state without going through the log
    fn query(&self, _request: &[u8]) -> Result<Vec<u8>, String> {
        Err("Queries are not supported by this state machine".to_string())
    }

    /// Create a snapshot of the current state
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with a snapshot
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String>;
}

/// Commands understood by [`KvStateMachine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Set a key-value pair, returning the previous value
    Set { key: String, value: Vec<u8> },
    /// Delete a key, returning the removed value
    Delete { key: String },
    /// Set `key` to `value` only if it currently equals `expected`
    CompareAndSwap {
        key: String,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    },
}

impl KvCommand {
    /// Encode for submission
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| format!("Failed to encode command: {}", e))
    }
}

/// Queries understood by [`KvStateMachine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvQuery {
    Get { key: String },
    Keys,
}

impl KvQuery {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| format!("Failed to encode query: {}", e))
    }

    /// Decode the answer to a [`KvQuery::Get`]
    pub fn decode_value(bytes: &[u8]) -> Result<Option<Vec<u8>>, String> {
        bincode::deserialize(bytes).map_err(|e| format!("Failed to decode value: {}", e))
    }
}

/// Result of applying a [`KvCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOutput {
    /// Previous value of the key
    Previous(Option<Vec<u8>>),
    /// Whether a compare-and-swap took effect, and the value it saw
    Swapped { applied: bool, current: Option<Vec<u8>> },
}

impl KvOutput {
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| format!("Failed to decode output: {}", e))
    }
}

/// In-memory key-value state machine
///
/// Ordered storage keeps snapshots byte-identical across replicas.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, Vec<u8>>,
    applied: u64,
}

impl KvStateMachine {
    /// Create a new empty state machine
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    /// Number of commands applied since creation or last restore
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>, String> {
        let cmd: KvCommand = bincode::deserialize(command)
            .map_err(|e| format!("Failed to decode command: {}", e))?;
        self.applied += 1;
        let output = match cmd {
            KvCommand::Set { key, value } => KvOutput::Previous(self.data.insert(key, value)),
            KvCommand::Delete { key } => KvOutput::Previous(self.data.remove(&key)),
            KvCommand::CompareAndSwap {
                key,
                expected,
                value,
            } => {
                let current = self.data.get(&key).cloned();
                if current == expected {
                    self.data.insert(key, value);
                    KvOutput::Swapped {
                        applied: true,
                        current,
                    }
                } else {
                    KvOutput::Swapped {
                        applied: false,
                        current,
                    }
                }
            }
        };
        bincode::serialize(&output).map_err(|e| format!("Failed to encode output: {}", e))
    }

    fn query(&self, request: &[u8]) -> Result<Vec<u8>, String> {
        let query: KvQuery = bincode::deserialize(request)
            .map_err(|e| format!("Failed to decode query: {}", e))?;
        let result = match query {
            KvQuery::Get { key } => bincode::serialize(&self.data.get(&key)),
            KvQuery::Keys => bincode::serialize(&self.data.keys().collect::<Vec<_>>()),
        };
        result.map_err(|e| format!("Failed to encode query result: {}", e))
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(&self.data).map_err(|e| format!("Failed to serialize snapshot: {}", e))
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String> {
        let data: BTreeMap<String, Vec<u8>> = bincode::deserialize(snapshot)
            .map_err(|e| format!("Failed to deserialize snapshot: {}", e))?;
        self.data = data;
        self.applied = 0;
        Ok(())
    }
}
