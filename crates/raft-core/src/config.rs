//! # config
//!
//! why: describe a node's static identity, peers, storage location and timing
//! relations: consumed once by raft-node at node construction, immutable afterwards
//! what: NodeConfig (serde, camelCase json), PeerAddress parsing, defaults and validation

use crate::error::ConfigError;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_SNAPSHOT_COUNT: u64 = 100_000;
pub const DEFAULT_SNAPSHOT_FRAME_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_APPEND_ENTRIES: usize = 128;

/// Static configuration of one raft node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    /// This node's position in `peers`
    pub id: NodeId,
    /// Single-node cluster: start as leader, short-circuit every rpc
    #[serde(alias = "standalong")]
    pub standalone: bool,
    /// Log the effective configuration at init
    pub debug_mode: bool,
    pub data_dir: PathBuf,
    /// Applied entries kept in the log before a snapshot is taken
    pub snapshot_count: u64,
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    /// Base election timeout; each arm adds jitter in `[0, base)`
    #[serde(rename = "electionTimeout")]
    pub election_timeout_ms: u64,
    /// Peer urls indexed by node id, this node included
    pub peers: Vec<String>,
    /// Compare last-log term before last-log index when granting votes
    pub strict_vote_check: bool,
    /// Bytes of snapshot carried by one InstallSnapshot request
    pub snapshot_frame_size: usize,
    /// Entries carried by one AppendEntries request
    pub max_append_entries: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            standalone: false,
            debug_mode: false,
            data_dir: PathBuf::from("data"),
            snapshot_count: 0,
            heartbeat_interval_ms: 0,
            election_timeout_ms: 0,
            peers: Vec::new(),
            strict_vote_check: false,
            snapshot_frame_size: 0,
            max_append_entries: 0,
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Replace every unset (zero) tunable with its default
    pub fn normalized(mut self) -> Self {
        if self.snapshot_count == 0 {
            self.snapshot_count = DEFAULT_SNAPSHOT_COUNT;
        }
        if self.heartbeat_interval_ms == 0 {
            self.heartbeat_interval_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
        }
        if self.election_timeout_ms == 0 {
            self.election_timeout_ms = DEFAULT_ELECTION_TIMEOUT_MS;
        }
        if self.snapshot_frame_size == 0 {
            self.snapshot_frame_size = DEFAULT_SNAPSHOT_FRAME_SIZE;
        }
        if self.max_append_entries == 0 {
            self.max_append_entries = DEFAULT_MAX_APPEND_ENTRIES;
        }
        self
    }

    /// Check the configuration and parse every peer url
    pub fn validate(&self) -> Result<Vec<PeerAddress>, ConfigError> {
        if self.id as usize >= self.peers.len() {
            return Err(ConfigError::UnknownSelf {
                id: self.id,
                peers: self.peers.len(),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "dataDir",
                reason: "must not be empty",
            });
        }
        self.peers.iter().map(|url| PeerAddress::parse(url)).collect()
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// True when this node alone forms a quorum
    pub fn is_single_voter(&self) -> bool {
        self.standalone || self.peers.len() <= 1
    }

    /// Ids taking part in elections and commit counting
    pub fn voters(&self) -> Vec<NodeId> {
        if self.standalone {
            vec![self.id]
        } else {
            (0..self.peers.len() as NodeId).collect()
        }
    }
}

/// Host and port of a peer, parsed from `host:port` or `scheme://host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub url: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidPeerUrl {
            url: url.to_string(),
            reason,
        };
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => rest,
            Some(_) => return Err(invalid("empty scheme")),
            None => url,
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
        Ok(Self {
            url: url.to_string(),
            host: host.to_string(),
            port,
        })
    }
}
