//! Server configuration

use anyhow::{anyhow, Context};
use replica_core::Member;
use replica_raft::RaftConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node: NodeSection,
    pub cluster: ClusterSection,
    pub raft: RaftSection,
    pub storage: StorageSection,
    pub service: ServiceSection,
    pub logging: LoggingSection,
}

/// This node's identity and the address peers reach its RPC endpoint on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: String,
    pub listen: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: "node1".to_string(),
            listen: "127.0.0.1:7001".to_string(),
        }
    }
}

/// Bootstrap roster. Leave this node out of it to start as a joiner that
/// waits to be added by the current leader. An empty list means a
/// single-node cluster of this node alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub max_append_entries: usize,
    pub snapshot_threshold: u64,
    pub snapshot_chunk_size: usize,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            heartbeat_interval_ms: 300,
            rpc_timeout_ms: 500,
            max_append_entries: 256,
            snapshot_threshold: 10000,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Client-facing JSON-lines endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub listen: String,
    pub max_line_length: usize,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8001".to_string(),
            max_line_length: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow!("Unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Parse `id=address` pairs separated by commas
pub fn parse_members(list: &str) -> anyhow::Result<Vec<Member>> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (id, address) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected id=address, got '{}'", part))?;
            if id.is_empty() || address.is_empty() {
                return Err(anyhow!("Expected id=address, got '{}'", part));
            }
            Ok(Member::new(id, address))
        })
        .collect()
}

impl ServerConfig {
    /// Load config from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ServerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to a YAML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overlaid with `REPLICA_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for the `REPLICA_*`
    /// variable names
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("REPLICA_NODE_ID") {
            config.node.id = id;
        }
        if let Some(listen) = lookup("REPLICA_LISTEN") {
            config.node.listen = listen;
        }
        if let Some(members) = lookup("REPLICA_MEMBERS") {
            config.cluster.members = parse_members(&members)?;
        }
        if let Some(listen) = lookup("REPLICA_CLIENT_LISTEN") {
            config.service.listen = listen;
        }
        if let Some(dir) = lookup("REPLICA_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = lookup("REPLICA_ELECTION_TIMEOUT_MIN_MS") {
            config.raft.election_timeout_min_ms = ms
                .parse()
                .context("REPLICA_ELECTION_TIMEOUT_MIN_MS")?;
        }
        if let Some(ms) = lookup("REPLICA_ELECTION_TIMEOUT_MAX_MS") {
            config.raft.election_timeout_max_ms = ms
                .parse()
                .context("REPLICA_ELECTION_TIMEOUT_MAX_MS")?;
        }
        if let Some(ms) = lookup("REPLICA_HEARTBEAT_INTERVAL_MS") {
            config.raft.heartbeat_interval_ms =
                ms.parse().context("REPLICA_HEARTBEAT_INTERVAL_MS")?;
        }
        if let Some(n) = lookup("REPLICA_SNAPSHOT_THRESHOLD") {
            config.raft.snapshot_threshold = n.parse().context("REPLICA_SNAPSHOT_THRESHOLD")?;
        }
        if let Some(level) = lookup("REPLICA_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = lookup("REPLICA_LOG_FORMAT") {
            config.logging.format = format.parse()?;
        }

        Ok(config)
    }

    /// This node as a roster member
    pub fn member(&self) -> Member {
        Member::new(self.node.id.as_str(), self.node.listen.as_str())
    }

    /// Consensus configuration for this node
    pub fn raft_config(&self) -> anyhow::Result<RaftConfig> {
        let member = self.member();
        let members = if self.cluster.members.is_empty() {
            vec![member.clone()]
        } else {
            self.cluster.members.clone()
        };
        let raft = &self.raft;
        let config = RaftConfig {
            member,
            members,
            election_timeout_min: Duration::from_millis(raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(raft.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(raft.rpc_timeout_ms),
            max_append_entries: raft.max_append_entries,
            snapshot_threshold: raft.snapshot_threshold,
            snapshot_chunk_size: raft.snapshot_chunk_size,
        };
        config.validate()?;
        Ok(config)
    }
}
