//! Public interface to the oramshard core library, linked by the shard-node
//! executable and by external replication transports.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod config;
mod shardnode;

pub use config::{
    endpoint_addr, ClusterConfig, OramNodeEndpoint, OramParams, RouterEndpoint,
    ShardNodeEndpoint,
};
pub use shardnode::{
    AccessReply, AccessRequest, ApiReply, ApiRequest, ApplyResult, BlockQuery,
    EntryId, ExternalApi, LocalLog, LogEntry, NodeConfig, OpKind, OramNodeStub,
    PathId, PendingRequest, ReplicaId, ReplicatedLog, RequestId,
    ResponseWaiters, RouterId, ShardNodeFsm, ShardNodeReplica, StashEntry,
    StateMachine, StorageId,
};
pub use utils::OramShardError;
