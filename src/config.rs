//! Cluster description file: endpoint tables and ORAM parameters.
//!
//! Read once at startup; the FSM core never looks at any of this and only
//! sees the constants injected at construction.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::shardnode::ReplicaId;
use crate::utils::OramShardError;

use serde::Deserialize;

/// A router endpoint entry.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct RouterEndpoint {
    pub ip: String,
    pub port: u16,
    pub id: u32,
}

/// A shard-node replica endpoint entry.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct ShardNodeEndpoint {
    pub ip: String,
    pub port: u16,
    pub id: u32,
    pub replica_id: ReplicaId,
}

/// An ORAM-node endpoint entry. `id` doubles as the storage shard the node
/// is responsible for.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct OramNodeEndpoint {
    pub ip: String,
    pub port: u16,
    pub id: u32,
    pub replica_id: ReplicaId,
}

/// ORAM parameter block.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct OramParams {
    /// Height of the ORAM tree.
    pub tree_height: u32,

    /// Hint for the expected number of simultaneously cached blocks.
    pub stash_capacity: usize,

    /// Router request batching timeout in millisecs.
    pub batch_timeout_ms: u64,

    /// Eviction epoch length in millisecs.
    pub epoch_ms: u64,

    /// Cap on simultaneously outstanding requests.
    pub max_requests: usize,

    /// Opaque block payload size in bytes.
    pub block_size: usize,
}

impl Default for OramParams {
    fn default() -> Self {
        OramParams {
            tree_height: 10,
            stash_capacity: 1000,
            batch_timeout_ms: 5,
            epoch_ms: 100,
            max_requests: 10000,
            block_size: 4096,
        }
    }
}

/// The whole cluster description.
#[derive(Debug, PartialEq, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub routers: Vec<RouterEndpoint>,
    pub shard_nodes: Vec<ShardNodeEndpoint>,
    pub oram_nodes: Vec<OramNodeEndpoint>,
    pub params: OramParams,
}

impl ClusterConfig {
    /// Parses a cluster description from a TOML string.
    pub fn from_str(s: &str) -> Result<Self, OramShardError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a cluster description file.
    pub fn from_file(path: &Path) -> Result<Self, OramShardError> {
        Self::from_str(&fs::read_to_string(path)?)
    }
}

/// Composes "ip:port" of an endpoint entry into a socket address.
pub fn endpoint_addr(ip: &str, port: u16) -> Result<SocketAddr, OramShardError> {
    Ok(format!("{}:{}", ip, port).parse()?)
}
